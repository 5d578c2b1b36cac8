//! # Plan Builders
//!
//! Funzioni pure che trasformano Options statiche + metadata della richiesta in
//! un piano di esecuzione immutabile.
//!
//! ## Responsabilità:
//! - Precedenza documentata: valore esplicito nei metadata > default nelle Options
//! - Normalizzazione dei range numerici (fps, crf, qualità, dpi)
//! - Derivazione dell'estensione di output:
//!   override esplicito -> container forzato -> estensione sorgente -> default
//! - `OutputPolicy`: politica di commit comune a tutte le famiglie
//!
//! Un Plan non ha stato mutabile e dipende solo dai suoi input.

pub mod image;
pub mod pdf;
pub mod video;

pub use self::image::{ImageOptions, ImageOutputFormat, ImagePlan};
pub use self::pdf::{PdfOptions, PdfPlan};
pub use self::video::{AnimationSettings, AudioPlan, EncoderShape, VideoMode, VideoOptions, VideoPlan};

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default filename infix for optimised copies: `<stem>.<marker>.<ext>`
pub const DEFAULT_MARKER: &str = "optimised";

/// Static output placement settings shared by every family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Filename infix distinguishing the optimised copy from the source
    pub marker: String,
    /// Overwrite the source instead of writing a marked copy next to it
    pub replace_in_place: bool,
    /// Copy access/modification times of the source onto the output
    pub preserve_timestamps: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            replace_in_place: false,
            preserve_timestamps: true,
        }
    }
}

/// Resolved commit policy for one request
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPolicy {
    pub require_smaller_output: bool,
    pub replace_in_place: bool,
    pub marker: String,
    pub preserve_timestamps: bool,
}

impl OutputPolicy {
    /// Merge static output options with the common metadata keys of `family`
    pub fn resolve(
        family: &str,
        options: &OutputOptions,
        require_smaller_default: bool,
        metadata: &Metadata,
    ) -> Self {
        let marker = metadata
            .get_str(family, "marker")
            .filter(|m| is_valid_marker(m))
            .unwrap_or_else(|| {
                if is_valid_marker(&options.marker) {
                    options.marker.clone()
                } else {
                    DEFAULT_MARKER.to_string()
                }
            });

        Self {
            require_smaller_output: metadata
                .get_bool(family, "require_smaller_output")
                .unwrap_or(require_smaller_default),
            replace_in_place: metadata
                .get_bool(family, "replace_in_place")
                .unwrap_or(options.replace_in_place),
            marker,
            preserve_timestamps: metadata
                .get_bool(family, "preserve_timestamps")
                .unwrap_or(options.preserve_timestamps),
        }
    }
}

/// Markers end up inside a file name: no separators, no dots at the edges
fn is_valid_marker(marker: &str) -> bool {
    !marker.is_empty()
        && !marker.starts_with('.')
        && !marker.ends_with('.')
        && !marker.contains(['/', '\\', '\0'])
}

/// Lowercased extension without the leading dot, if any
pub(crate) fn normalise_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.').to_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        None
    } else {
        Some(ext)
    }
}

/// Lowercased extension of `path`
pub(crate) fn source_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(normalise_extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_policy_defaults() {
        let policy = OutputPolicy::resolve("video", &OutputOptions::default(), true, &Metadata::new());
        assert!(policy.require_smaller_output);
        assert!(!policy.replace_in_place);
        assert_eq!(policy.marker, "optimised");
        assert!(policy.preserve_timestamps);
    }

    #[test]
    fn test_output_policy_metadata_overrides() {
        let mut meta = Metadata::new();
        meta.insert("pdf.replace_in_place", true);
        meta.insert("require_smaller_output", "no");
        meta.insert("marker", "min");
        let policy = OutputPolicy::resolve("pdf", &OutputOptions::default(), true, &meta);
        assert!(policy.replace_in_place);
        assert!(!policy.require_smaller_output);
        assert_eq!(policy.marker, "min");
    }

    #[test]
    fn test_invalid_marker_falls_back() {
        let mut meta = Metadata::new();
        meta.insert("marker", json!("../escape"));
        let options = OutputOptions {
            marker: "".to_string(),
            ..Default::default()
        };
        let policy = OutputPolicy::resolve("image", &options, true, &meta);
        assert_eq!(policy.marker, DEFAULT_MARKER);
    }

    #[test]
    fn test_normalise_extension() {
        assert_eq!(normalise_extension(".MP4").as_deref(), Some("mp4"));
        assert_eq!(normalise_extension("gif").as_deref(), Some("gif"));
        assert_eq!(normalise_extension("").as_deref(), None);
        assert_eq!(normalise_extension("m p4").as_deref(), None);
    }
}
