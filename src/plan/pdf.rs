//! # PDF Plan
//!
//! ## Responsabilità:
//! - Scelta tra modalità lossless (passthrough delle immagini) e lossy (`/ebook`
//!   con downsampling)
//! - Normalizzazione di DPI e compatibility level
//! - Politica di output e blocco opzionale di rimozione metadata
//!
//! ## Chiavi metadata (prefisso `pdf.`):
//! `lossy`, `dpi`, `strip_metadata`, `compatibility_level`

use super::{OutputOptions, OutputPolicy};
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FAMILY: &str = "pdf";

pub const MIN_DPI: u32 = 72;
pub const MAX_DPI: u32 = 600;

/// Compatibility levels accepted by `pdfwrite`
const COMPATIBILITY_LEVELS: &[&str] = &["1.3", "1.4", "1.5", "1.6", "1.7"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfOptions {
    /// Downsample and recompress images (`/ebook` preset)
    pub lossy: bool,
    /// Target resolution for downsampled images in lossy mode
    pub dpi: u32,
    pub strip_metadata: bool,
    pub compatibility_level: String,
    pub require_smaller_output: bool,
    pub timeout_secs: Option<u64>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            lossy: false,
            dpi: 150,
            strip_metadata: false,
            compatibility_level: "1.5".to_string(),
            require_smaller_output: true,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfPlan {
    pub source: PathBuf,
    pub lossy: bool,
    pub dpi: u32,
    pub strip_metadata: bool,
    pub compatibility_level: String,
    pub output: OutputPolicy,
    pub timeout: Option<Duration>,
}

impl PdfPlan {
    pub fn build(
        source: &Path,
        options: &PdfOptions,
        output_options: &OutputOptions,
        metadata: &Metadata,
    ) -> Self {
        let compatibility_level = metadata
            .get_str(FAMILY, "compatibility_level")
            .map(|level| level.trim().to_string())
            .filter(|level| COMPATIBILITY_LEVELS.contains(&level.as_str()))
            .or_else(|| {
                COMPATIBILITY_LEVELS
                    .contains(&options.compatibility_level.as_str())
                    .then(|| options.compatibility_level.clone())
            })
            .unwrap_or_else(|| "1.5".to_string());

        Self {
            source: source.to_path_buf(),
            lossy: metadata.get_bool(FAMILY, "lossy").unwrap_or(options.lossy),
            dpi: metadata
                .get_u32(FAMILY, "dpi")
                .unwrap_or(options.dpi)
                .clamp(MIN_DPI, MAX_DPI),
            strip_metadata: metadata
                .get_bool(FAMILY, "strip_metadata")
                .unwrap_or(options.strip_metadata),
            compatibility_level,
            output: OutputPolicy::resolve(FAMILY, output_options, options.require_smaller_output, metadata),
            timeout: options.timeout_secs.map(Duration::from_secs),
        }
    }

    /// The compressed file always keeps the `.pdf` extension
    pub fn output_extension(&self) -> &'static str {
        "pdf"
    }
}
