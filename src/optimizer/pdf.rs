//! # PDF Optimiser
//!
//! ## Flusso:
//! 1. Validazione: magic `%PDF-` entro i primi 1024 byte, nessun dizionario
//!    `/Encrypt` nelle finestre iniziale e finale da 64 KiB
//! 2. `PdfPlan::build`
//! 3. Compressione Ghostscript in una directory temporanea privata
//! 4. Commit del candidato
//!
//! I file che non superano la validazione falliscono prima di costruire il piano.

use super::{candidate_path, commit, missing_source, Optimiser};
use crate::error::{OptimizeError, Result};
use crate::plan::{source_extension, OutputOptions, PdfOptions, PdfPlan};
use crate::request::{ItemType, OptimisationRequest, OptimisationResult};
use crate::toolchain::{ExecutionContext, PdfToolchain};
use crate::utils::file_label;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

const MAGIC: &[u8] = b"%PDF-";
const MAGIC_WINDOW: u64 = 1024;
const ENCRYPT_WINDOW: u64 = 64 * 1024;
const ENCRYPT_MARKER: &[u8] = b"/Encrypt";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Check the magic bytes and look for an encryption dictionary
pub async fn validate_pdf(path: &Path) -> Result<()> {
    let mut file = File::open(path).await?;
    let length = file.metadata().await?.len();

    let mut head = Vec::new();
    (&mut file).take(ENCRYPT_WINDOW).read_to_end(&mut head).await?;

    let magic_end = head.len().min(MAGIC_WINDOW as usize);
    if !contains(&head[..magic_end], MAGIC) {
        return Err(OptimizeError::InvalidPdf(format!(
            "{} has no %PDF- header",
            file_label(path)
        )));
    }

    if contains(&head, ENCRYPT_MARKER) {
        return Err(OptimizeError::EncryptedPdf(path.to_path_buf()));
    }

    if length > ENCRYPT_WINDOW {
        let tail_start = length.saturating_sub(ENCRYPT_WINDOW).max(ENCRYPT_WINDOW - ENCRYPT_MARKER.len() as u64);
        file.seek(SeekFrom::Start(tail_start)).await?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).await?;
        if contains(&tail, ENCRYPT_MARKER) {
            return Err(OptimizeError::EncryptedPdf(path.to_path_buf()));
        }
    }
    Ok(())
}

pub struct PdfOptimiser {
    options: PdfOptions,
    output: OutputOptions,
    toolchain: Arc<dyn PdfToolchain>,
}

impl PdfOptimiser {
    pub fn new(options: PdfOptions, output: OutputOptions, toolchain: Arc<dyn PdfToolchain>) -> Self {
        Self {
            options,
            output,
            toolchain,
        }
    }
}

#[async_trait]
impl Optimiser for PdfOptimiser {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn item_type(&self) -> ItemType {
        ItemType::Pdf
    }

    /// PDFs submitted as generic documents are accepted too
    fn accepts(&self, request: &OptimisationRequest) -> bool {
        match request.item_type() {
            ItemType::Pdf => true,
            ItemType::Document => source_extension(request.source()).as_deref() == Some("pdf"),
            _ => false,
        }
    }

    async fn optimise(&self, request: &OptimisationRequest, ctx: &ExecutionContext) -> Result<OptimisationResult> {
        let started = Instant::now();
        let id = request.id();
        let source = request.source();

        if let Some(failed) = missing_source(request).await {
            return Ok(failed);
        }
        match validate_pdf(source).await {
            Ok(()) => {}
            Err(e @ (OptimizeError::InvalidPdf(_) | OptimizeError::EncryptedPdf(_))) => {
                warn!("❌ {}", e);
                return Ok(OptimisationResult::failed(id, e.to_string()));
            }
            Err(e) => return Err(e),
        }
        ctx.check_cancelled()?;

        let plan = PdfPlan::build(source, &self.options, &self.output, request.metadata());
        debug!(
            "PDF plan for {}: lossy={}, dpi={}, level {}",
            file_label(source),
            plan.lossy,
            plan.dpi,
            plan.compatibility_level
        );

        let workdir = ctx.temp_dir("media-engine-pdf-")?;
        let candidate = candidate_path(workdir.path(), plan.output_extension());
        let outcome = self.toolchain.compress(&plan, &candidate, ctx).await?;
        if !outcome.success {
            warn!("❌ PDF compression failed for {}: {}", file_label(source), outcome.error_message());
            return Ok(OptimisationResult::failed(id, outcome.error_message()).with_duration(started.elapsed()));
        }
        ctx.check_cancelled()?;

        let result = commit::commit(id, source, &candidate, plan.output_extension(), &plan.output).await?;
        Ok(result.with_duration(started.elapsed()))
    }
}
