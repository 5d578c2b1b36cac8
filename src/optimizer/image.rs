//! # Image Optimiser
//!
//! ## Flusso:
//! 1. Sniffing del formato dai byte iniziali (l'estensione non basta)
//! 2. Per i PNG: verifica del canale alpha, che decide se convertire in JPEG
//! 3. `ImagePlan::build` + encode in-process in una directory temporanea
//! 4. Commit del candidato
//!
//! ## Formati letti:
//! JPEG, PNG, WebP, GIF, BMP, TIFF. Il resto risulta `Unsupported`.

use super::{candidate_path, commit, missing_source, Optimiser};
use crate::error::{OptimizeError, Result};
use crate::plan::{ImageOptions, ImagePlan, OutputOptions};
use crate::request::{ItemType, OptimisationRequest, OptimisationResult};
use crate::toolchain::{ExecutionContext, ImageToolchain};
use crate::utils::file_label;
use ::image::codecs::png::PngDecoder;
use ::image::{ImageDecoder, ImageFormat};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const SNIFF_BYTES: u64 = 4096;

const READABLE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

/// Sniff the container format and, for PNG, whether it carries alpha.
///
/// `Ok(None)` means the header is not an image format the engine reads.
pub fn sniff_image(path: &Path) -> Result<Option<(ImageFormat, bool)>> {
    let mut header = Vec::new();
    File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut header)?;

    let format = match ::image::guess_format(&header) {
        Ok(format) if READABLE_FORMATS.contains(&format) => format,
        _ => return Ok(None),
    };

    let has_alpha = if format == ImageFormat::Png {
        let decoder = PngDecoder::new(BufReader::new(File::open(path)?))?;
        decoder.color_type().has_alpha()
    } else {
        false
    };
    Ok(Some((format, has_alpha)))
}

pub struct ImageOptimiser {
    options: ImageOptions,
    output: OutputOptions,
    toolchain: Arc<dyn ImageToolchain>,
}

impl ImageOptimiser {
    pub fn new(options: ImageOptions, output: OutputOptions, toolchain: Arc<dyn ImageToolchain>) -> Self {
        Self {
            options,
            output,
            toolchain,
        }
    }
}

#[async_trait]
impl Optimiser for ImageOptimiser {
    fn name(&self) -> &'static str {
        "image"
    }

    fn item_type(&self) -> ItemType {
        ItemType::Image
    }

    async fn optimise(&self, request: &OptimisationRequest, ctx: &ExecutionContext) -> Result<OptimisationResult> {
        let started = Instant::now();
        let id = request.id();
        let source = request.source();

        if let Some(failed) = missing_source(request).await {
            return Ok(failed);
        }

        let sniff_path: PathBuf = source.to_path_buf();
        let sniffed = tokio::task::spawn_blocking(move || sniff_image(&sniff_path))
            .await
            .map_err(|e| OptimizeError::Validation(format!("format detection task failed: {}", e)))?;
        let (format, has_alpha) = match sniffed {
            Ok(Some(found)) => found,
            Ok(None) => {
                return Ok(OptimisationResult::unsupported(
                    id,
                    format!("{} is not a readable image", file_label(source)),
                ))
            }
            Err(e) => {
                warn!("❌ Cannot read image header of {}: {}", file_label(source), e);
                return Ok(OptimisationResult::failed(id, e.to_string()));
            }
        };
        ctx.check_cancelled()?;

        let plan = ImagePlan::build(source, format, has_alpha, &self.options, &self.output, request.metadata());
        debug!(
            "Image plan for {}: {:?} (alpha: {}) -> {:?} .{}",
            file_label(source),
            format,
            has_alpha,
            plan.format,
            plan.output_extension
        );

        let workdir = ctx.temp_dir("media-engine-image-")?;
        let candidate = candidate_path(workdir.path(), &plan.output_extension);
        let outcome = self.toolchain.encode(&plan, &candidate, ctx).await?;
        if !outcome.success {
            warn!("❌ Image optimisation failed for {}: {}", file_label(source), outcome.error_message());
            return Ok(OptimisationResult::failed(id, outcome.error_message()).with_duration(started.elapsed()));
        }
        ctx.check_cancelled()?;

        let result = commit::commit(id, source, &candidate, &plan.output_extension, &plan.output).await?;
        Ok(result.with_duration(started.elapsed()))
    }
}
