//! # Optimizer Module
//!
//! Un optimiser per famiglia di media, tutti dietro il trait `Optimiser`.
//!
//! ## Sottomoduli:
//! - `image`, `video`, `pdf`: check di applicabilità, costruzione del piano,
//!   invocazione del toolchain
//! - `commit`: validazione del candidato e scrittura nella posizione finale
//!
//! ## Contratto:
//! - Sorgente mancante o non valida: `Failed`/`Unsupported` senza invocare alcun toolchain
//! - Fallimento del toolchain: `Failed` con il messaggio del tool
//! - Cancellazione: `Err(OptimizeError::Cancelled)`, che il coordinator converte
//! - Le directory temporanee vengono rimosse su ogni percorso

pub mod commit;
pub mod image;
pub mod pdf;
pub mod video;

pub use self::image::ImageOptimiser;
pub use self::pdf::PdfOptimiser;
pub use self::video::VideoOptimiser;

use crate::error::{OptimizeError, Result};
use crate::plan::{ImageOptions, OutputOptions, PdfOptions, VideoOptions};
use crate::request::{ItemType, OptimisationRequest, OptimisationResult};
use crate::tool_resolver::ToolPathResolver;
use crate::toolchain::{ExecutionContext, FfmpegToolchain, GhostscriptToolchain, InProcessImageToolchain, ProcessRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One capability variant of the engine
#[async_trait]
pub trait Optimiser: Send + Sync {
    /// Family name, also the prefix of its metadata keys (`<name>.<key>`)
    fn name(&self) -> &'static str;

    fn item_type(&self) -> ItemType;

    fn accepts(&self, request: &OptimisationRequest) -> bool {
        request.item_type() == self.item_type()
    }

    /// Run the request to a terminal result.
    ///
    /// `Err` is reserved for cancellation and unexpected failures; the
    /// coordinator turns it into a `Cancelled` or `Failed` result.
    async fn optimise(&self, request: &OptimisationRequest, ctx: &ExecutionContext) -> Result<OptimisationResult>;
}

/// Static options for every optimiser family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimiserOptions {
    pub image: ImageOptions,
    pub video: VideoOptions,
    pub pdf: PdfOptions,
    pub output: OutputOptions,
}

/// The image, video and PDF optimisers wired to the real toolchains
pub fn standard_set(options: &OptimiserOptions, resolver: Arc<ToolPathResolver>) -> Vec<Arc<dyn Optimiser>> {
    let runner = ProcessRunner::new(resolver);
    vec![
        Arc::new(ImageOptimiser::new(
            options.image.clone(),
            options.output.clone(),
            Arc::new(InProcessImageToolchain::new(runner.clone())),
        )),
        Arc::new(VideoOptimiser::new(
            options.video.clone(),
            options.output.clone(),
            Arc::new(FfmpegToolchain::new(runner.clone())),
        )),
        Arc::new(PdfOptimiser::new(
            options.pdf.clone(),
            options.output.clone(),
            Arc::new(GhostscriptToolchain::new(runner)),
        )),
    ]
}

/// `Some(failed result)` when the source file is gone
pub(crate) async fn missing_source(request: &OptimisationRequest) -> Option<OptimisationResult> {
    match tokio::fs::metadata(request.source()).await {
        Ok(meta) if meta.is_file() => None,
        _ => Some(OptimisationResult::failed(
            request.id(),
            OptimizeError::SourceMissing(request.source().to_path_buf()).to_string(),
        )),
    }
}

/// Private scratch file name for the toolchain output
pub(crate) fn candidate_path(workdir: &Path, extension: &str) -> std::path::PathBuf {
    workdir.join(format!("candidate.{}", extension))
}
