//! # File Management Module
//!
//! Questo modulo gestisce le operazioni sui file comuni a core e CLI.
//!
//! ## Responsabilità:
//! - Discovery ricorsiva dei file media in directory (`walkdir`)
//! - Attesa che un file appena scritto si stabilizzi (dimensione e mtime
//!   invariati tra due poll consecutivi)
//! - Formattazione human-readable delle dimensioni e calcolo della riduzione
//!
//! ## Formati cercati:
//! Tutto ciò che `ItemType::from_path` riconosce come Image, Video o Pdf.
//!
//! ## Esempio:
//! ```rust,no_run
//! use media_engine::file_manager::FileManager;
//! use std::path::Path;
//!
//! let files = FileManager::find_media_files(Path::new("/path/to/media"));
//! println!("{} files, {}", files.len(), FileManager::format_size(1536));
//! ```

use crate::error::{OptimizeError, Result};
use crate::request::ItemType;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Interval between two size/mtime samples while waiting for a file to settle
pub const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Size and modification time of a file
    pub async fn get_file_info(path: &Path) -> Result<(u64, SystemTime)> {
        let metadata = fs::metadata(path).await?;
        Ok((metadata.len(), metadata.modified()?))
    }

    /// Find all files under `root` the engine has an optimiser for.
    ///
    /// A plain file path is returned as-is when its type is supported.
    pub fn find_media_files(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|path| Self::is_supported_format(path))
            .collect();
        files.sort();
        files
    }

    /// Check if a file format is supported
    pub fn is_supported_format(path: &Path) -> bool {
        matches!(
            ItemType::from_path(path),
            ItemType::Image | ItemType::Video | ItemType::Pdf
        )
    }

    /// Wait until `path` stops changing.
    ///
    /// Returns `Ok(true)` once two consecutive samples agree, `Ok(false)` when
    /// `timeout` expires first (the caller proceeds anyway).
    pub async fn wait_until_stable(
        path: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut previous = Self::sample(path).await;

        loop {
            if Instant::now() >= deadline {
                debug!("{} still changing after {:?}", path.display(), timeout);
                return Ok(false);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OptimizeError::Cancelled("cancelled while waiting for file to settle".to_string()));
                }
                _ = tokio::time::sleep(SETTLE_POLL_INTERVAL) => {}
            }

            let current = Self::sample(path).await;
            if current.is_some() && current == previous {
                return Ok(true);
            }
            previous = current;
        }
    }

    async fn sample(path: &Path) -> Option<(u64, SystemTime)> {
        Self::get_file_info(path).await.ok()
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}
