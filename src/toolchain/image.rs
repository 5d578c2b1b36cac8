//! # Image Toolchain
//!
//! Encoder immagini in-process basato sul crate `image`.
//!
//! ## Responsabilità:
//! - Decode con rilevamento del formato dal contenuto (non dall'estensione)
//! - Ridimensionamento Lanczos3 entro `max_width` / `max_height`, aspect ratio preservato
//! - Encode JPEG (alpha composto su sfondo bianco) o PNG con compressione massima
//! - Passaggio lossless esterno opzionale (`jpegoptim` / `oxipng`) tramite il
//!   `ProcessRunner`; un suo fallimento non invalida il file già codificato
//!
//! Decode ed encode girano su `spawn_blocking` per non bloccare il runtime.

use super::process::{OutputChannel, ProcessRunner, ToolInvocation};
use super::progress::NoProgress;
use super::{ExecutionContext, ImageToolchain, ToolchainResult};
use crate::args;
use crate::error::Result;
use crate::plan::{ImageOutputFormat, ImagePlan};
use crate::utils::{file_label, path_arg};
use ::image::codecs::jpeg::JpegEncoder;
use ::image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use ::image::imageops::FilterType;
use ::image::io::Reader as ImageReader;
use ::image::{ColorType, DynamicImage, ImageEncoder, RgbImage};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct InProcessImageToolchain {
    runner: ProcessRunner,
}

impl InProcessImageToolchain {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    /// Arguments of the optional lossless pass, which rewrites `output` in place
    pub fn lossless_args(format: ImageOutputFormat, output: &Path) -> Vec<String> {
        match format {
            ImageOutputFormat::Jpeg => args!["--strip-all", "--all-progressive", "-q", path_arg(output)],
            ImageOutputFormat::Png => args!["-o", "4", "--strip", "safe", "-q", path_arg(output)],
        }
    }

    async fn lossless_pass(&self, plan: &ImagePlan, output: &Path, ctx: &ExecutionContext) -> Result<()> {
        let tool = plan.format.lossless_tool();
        if !self.runner.resolver().is_available(tool) {
            debug!("{} not available, skipping lossless pass", tool);
            return Ok(());
        }

        let mut stage_ctx = ctx.clone();
        stage_ctx.progress = ctx.progress.stage(80.0, 100.0);
        let invocation = ToolInvocation::new(tool, Self::lossless_args(plan.format, output))
            .progress_on(OutputChannel::Stdout)
            .with_timeout(plan.timeout);
        let result = self.runner.run(&invocation, Box::new(NoProgress), &stage_ctx).await?;
        if !result.success {
            warn!("⚠️  Lossless pass skipped for {}: {}", file_label(output), result.error_message());
        }
        Ok(())
    }
}

/// Decode, resize and encode `plan.source` into `output`
fn encode_blocking(plan: &ImagePlan, output: &Path) -> Result<(u32, u32)> {
    let image = ImageReader::open(&plan.source)?.with_guessed_format()?.decode()?;
    let image = fit_within(image, plan.max_width, plan.max_height);
    let (width, height) = (image.width(), image.height());

    let mut writer = BufWriter::new(File::create(output)?);
    match plan.format {
        ImageOutputFormat::Jpeg => {
            let rgb = flatten_to_rgb(&image);
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, plan.quality);
            encoder.encode(rgb.as_raw(), width, height, ColorType::Rgb8)?;
        }
        ImageOutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(&mut writer, CompressionType::Best, PngFilter::Adaptive);
            if image.color().has_alpha() {
                let rgba = image.to_rgba8();
                encoder.write_image(rgba.as_raw(), width, height, ColorType::Rgba8)?;
            } else {
                let rgb = image.to_rgb8();
                encoder.write_image(rgb.as_raw(), width, height, ColorType::Rgb8)?;
            }
        }
    }
    writer.flush()?;
    Ok((width, height))
}

/// Downscale so that the image fits the given bounds; never upscales
fn fit_within(image: DynamicImage, max_width: Option<u32>, max_height: Option<u32>) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let bound_w = max_width.unwrap_or(width).min(width);
    let bound_h = max_height.unwrap_or(height).min(height);
    if bound_w == width && bound_h == height {
        return image;
    }
    image.resize(bound_w.max(1), bound_h.max(1), FilterType::Lanczos3)
}

/// RGB copy with any alpha channel composited over white
fn flatten_to_rgb(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        ::image::Rgb([blend(r), blend(g), blend(b)])
    })
}

#[async_trait]
impl ImageToolchain for InProcessImageToolchain {
    async fn encode(&self, plan: &ImagePlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult> {
        ctx.check_cancelled()?;
        info!("🖼️  Encoding {} as {:?} (quality {})", file_label(&plan.source), plan.format, plan.quality);
        ctx.progress.report(5.0, Some("decoding"));

        let blocking_plan = plan.clone();
        let target: PathBuf = output.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || encode_blocking(&blocking_plan, &target)).await;

        match outcome {
            Ok(Ok((width, height))) => debug!("Encoded {}x{} -> {}", width, height, file_label(output)),
            Ok(Err(e)) => return Ok(ToolchainResult::failed(e.to_string())),
            Err(e) => return Ok(ToolchainResult::failed(format!("encoder task failed: {}", e))),
        }
        // L'encode in-process non è interrompibile: si controlla subito dopo
        ctx.check_cancelled()?;
        ctx.progress.report(80.0, Some("encoded"));

        if plan.lossless_pass {
            self.lossless_pass(plan, output, ctx).await?;
        }
        ctx.progress.report(100.0, None);
        Ok(ToolchainResult::ok())
    }
}
