//! # Toolchains
//!
//! Adapter verso i tool esterni (ffmpeg, gifski, Ghostscript) e verso
//! l'encoder immagini in-process.
//!
//! ## Responsabilità:
//! - `ExecutionContext`: token di cancellazione, reporter di progresso e radice
//!   delle directory temporanee di una singola esecuzione
//! - `ProcessRunner`: spawn in un process group dedicato, lettura in streaming
//!   di stdout/stderr, kill dell'intero albero alla cancellazione
//! - Traits `VideoToolchain` / `PdfToolchain` / `ImageToolchain`, così gli
//!   optimiser possono essere testati con toolchain finte
//!
//! Un fallimento del tool diventa `ToolchainResult { success: false, .. }`.
//! Solo la cancellazione attraversa il confine come `Err`.

pub mod ffmpeg;
pub mod ghostscript;
pub mod image;
pub mod process;
pub mod progress;

pub use self::ffmpeg::FfmpegToolchain;
pub use self::ghostscript::GhostscriptToolchain;
pub use self::image::InProcessImageToolchain;
pub use self::process::{OutputChannel, ProcessRunner, ToolInvocation};
pub use self::progress::{ProgressReporter, ProgressSink, ProgressTracker};

use crate::error::{OptimizeError, Result};
use crate::plan::{ImagePlan, PdfPlan, VideoPlan};
use crate::request::RequestId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Per-execution state handed from the coordinator down to the toolchains
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
    /// Parent directory for private temp dirs (system temp dir when `None`)
    pub temp_root: Option<PathBuf>,
}

impl ExecutionContext {
    pub fn new(request_id: RequestId, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            request_id,
            cancel,
            progress,
            temp_root: None,
        }
    }

    /// Context with its own token and a reporter that drops every event
    pub fn detached(request_id: RequestId) -> Self {
        Self::new(request_id, CancellationToken::new(), ProgressReporter::noop(request_id))
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the token has fired
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(OptimizeError::Cancelled(format!("request {} cancelled", self.request_id)))
        } else {
            Ok(())
        }
    }

    /// Private temp dir, removed when the returned guard is dropped
    pub fn temp_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match self.temp_root {
            Some(ref root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

/// Outcome of one toolchain call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainResult {
    pub success: bool,
    pub error: Option<String>,
}

impl ToolchainResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown toolchain error")
    }
}

#[async_trait]
pub trait VideoToolchain: Send + Sync {
    /// Ordinary re-encode of `plan.source` into `output`
    async fn transcode(&self, plan: &VideoPlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult>;

    /// Frame extraction followed by GIF assembly into `output`
    async fn export_animation(
        &self,
        plan: &VideoPlan,
        output: &Path,
        ctx: &ExecutionContext,
    ) -> Result<ToolchainResult>;
}

#[async_trait]
pub trait PdfToolchain: Send + Sync {
    async fn compress(&self, plan: &PdfPlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult>;
}

#[async_trait]
pub trait ImageToolchain: Send + Sync {
    async fn encode(&self, plan: &ImagePlan, output: &Path, ctx: &ExecutionContext) -> Result<ToolchainResult>;
}
