//! # Image Plan
//!
//! ## Responsabilità:
//! - Scelta del formato di output (JPEG o PNG) in base a sorgente, trasparenza
//!   e override espliciti
//! - Qualità JPEG e dimensioni massime per il ridimensionamento
//! - Passaggio lossless esterno opzionale (jpegoptim / oxipng)
//!
//! ## Chiavi metadata (prefisso `image.`):
//! `quality`, `max_width`, `max_height`, `extension`, `format`, `lossless_pass`

use super::{normalise_extension, source_extension, OutputOptions, OutputPolicy};
use crate::metadata::Metadata;
use ::image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FAMILY: &str = "image";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// JPEG quality (1-100)
    pub quality: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Opaque PNGs are re-encoded as JPEG
    pub convert_png_to_jpeg: bool,
    /// Run jpegoptim/oxipng on the encoded file when available
    pub lossless_pass: bool,
    pub require_smaller_output: bool,
    pub timeout_secs: Option<u64>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            max_width: None,
            max_height: None,
            convert_png_to_jpeg: true,
            lossless_pass: false,
            require_smaller_output: true,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutputFormat {
    Jpeg,
    Png,
}

impl ImageOutputFormat {
    fn from_name(name: &str) -> Option<Self> {
        match normalise_extension(name)?.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    /// External tool used for the optional lossless pass
    pub fn lossless_tool(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpegoptim",
            Self::Png => "oxipng",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlan {
    pub source: PathBuf,
    pub format: ImageOutputFormat,
    pub quality: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub lossless_pass: bool,
    pub output_extension: String,
    pub output: OutputPolicy,
    pub timeout: Option<Duration>,
}

impl ImagePlan {
    /// `source_format` and `has_alpha` come from sniffing the file header
    pub fn build(
        source: &Path,
        source_format: ImageFormat,
        has_alpha: bool,
        options: &ImageOptions,
        output_options: &OutputOptions,
        metadata: &Metadata,
    ) -> Self {
        let explicit_extension = metadata
            .get_str(FAMILY, "extension")
            .and_then(|ext| normalise_extension(&ext))
            .filter(|ext| ImageOutputFormat::from_name(ext).is_some());

        let format = metadata
            .get_str(FAMILY, "format")
            .and_then(|name| ImageOutputFormat::from_name(&name))
            .or_else(|| explicit_extension.as_deref().and_then(ImageOutputFormat::from_name))
            .unwrap_or(match source_format {
                ImageFormat::Png if has_alpha || !options.convert_png_to_jpeg => ImageOutputFormat::Png,
                _ => ImageOutputFormat::Jpeg,
            });

        let output_extension = explicit_extension
            .filter(|ext| ImageOutputFormat::from_name(ext) == Some(format))
            .or_else(|| {
                // Una sorgente .jpeg mantiene la propria grafia
                source_extension(source).filter(|ext| ImageOutputFormat::from_name(ext) == Some(format))
            })
            .unwrap_or_else(|| match format {
                ImageOutputFormat::Jpeg => "jpg".to_string(),
                ImageOutputFormat::Png => "png".to_string(),
            });

        Self {
            source: source.to_path_buf(),
            format,
            quality: metadata
                .get_u32(FAMILY, "quality")
                .map(|q| q.min(100) as u8)
                .unwrap_or(options.quality)
                .clamp(1, 100),
            max_width: metadata.get_u32(FAMILY, "max_width").or(options.max_width).filter(|w| *w > 0),
            max_height: metadata.get_u32(FAMILY, "max_height").or(options.max_height).filter(|h| *h > 0),
            lossless_pass: metadata
                .get_bool(FAMILY, "lossless_pass")
                .unwrap_or(options.lossless_pass),
            output_extension,
            output: OutputPolicy::resolve(FAMILY, output_options, options.require_smaller_output, metadata),
            timeout: options.timeout_secs.map(Duration::from_secs),
        }
    }
}
