//! # Progress Rendering and Statistics Module
//!
//! Questo modulo gestisce la progress bar della CLI e le statistiche di ottimizzazione.
//!
//! ## Responsabilità:
//! - Progress bar visual con `indicatif` alimentata dagli eventi del coordinator
//! - Tracking statistiche a partire dai risultati terminali
//! - Report finale con statistiche aggregate
//!
//! ## Componenti principali:
//! - `ProgressManager`: Gestisce la progress bar principale
//! - `OptimizationStats`: Traccia statistiche cumulative
//!
//! ## Classificazione dei risultati:
//! - **optimized**: `Succeeded` con output più piccolo scritto su disco
//! - **skipped**: `Succeeded` senza miglioramento, oppure `Unsupported`
//! - **errors**: `Failed`
//! - **cancelled**: `Cancelled`
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================================] 150/150 (100%) ✅ photo.jpg: 45.2% saved
//! ```

use crate::file_manager::FileManager;
use crate::request::{OptimisationResult, OptimisationStatus};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Manages progress reporting for the CLI
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(total_files: u64) -> Self {
        let bar = ProgressBar::new(total_files);

        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// A manager that draws nothing (JSON mode)
    pub fn hidden(total_files: u64) -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(total_files), ProgressDrawTarget::hidden()),
        }
    }

    /// Count one finished file and show `message`
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    /// Set a custom message without incrementing
    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Print a line above the bar without breaking it
    pub fn println(&self, line: &str) {
        self.bar.println(line);
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

/// Statistics tracker for optimisation results
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OptimizationStats {
    pub files_processed: usize,
    pub files_optimized: usize,
    pub files_skipped: usize,
    pub total_bytes_saved: u64,
    pub total_original_size: u64,
    pub errors: usize,
    pub cancelled: usize,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_optimized(&mut self, original_size: u64, new_size: u64) {
        self.files_processed += 1;
        self.files_optimized += 1;
        self.total_original_size += original_size;
        self.total_bytes_saved += original_size.saturating_sub(new_size);
    }

    pub fn add_skipped(&mut self, original_size: u64) {
        self.files_processed += 1;
        self.files_skipped += 1;
        self.total_original_size += original_size;
    }

    pub fn add_error(&mut self) {
        self.files_processed += 1;
        self.errors += 1;
    }

    pub fn add_cancelled(&mut self) {
        self.files_processed += 1;
        self.cancelled += 1;
    }

    /// Fold one terminal result into the counters
    pub fn record(&mut self, result: &OptimisationResult) {
        match result.status {
            OptimisationStatus::Succeeded => match (result.original_size, result.optimised_size) {
                (Some(original), Some(optimised)) if optimised < original => {
                    self.add_optimized(original, optimised)
                }
                (original, _) => self.add_skipped(original.unwrap_or(0)),
            },
            OptimisationStatus::Unsupported => self.add_skipped(0),
            OptimisationStatus::Failed => self.add_error(),
            OptimisationStatus::Cancelled => self.add_cancelled(),
        }
    }

    pub fn overall_reduction_percent(&self) -> f64 {
        if self.total_original_size > 0 {
            (self.total_bytes_saved as f64 / self.total_original_size as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Nothing failed or was cancelled
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.cancelled == 0
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Processed: {} files | Optimized: {} | Skipped: {} | Errors: {} | Cancelled: {} | Total saved: {} ({:.2}%)",
            self.files_processed,
            self.files_optimized,
            self.files_skipped,
            self.errors,
            self.cancelled,
            FileManager::format_size(self.total_bytes_saved),
            self.overall_reduction_percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestId;
    use std::path::PathBuf;

    #[test]
    fn test_record_classifies_results() {
        let id = RequestId::new();
        let mut stats = OptimizationStats::new();

        stats.record(&OptimisationResult::succeeded(id, PathBuf::from("a.jpg"), "ok").with_sizes(1000, 400));
        stats.record(&OptimisationResult::succeeded(id, PathBuf::from("b.jpg"), "no improvement").with_sizes(500, 500));
        stats.record(&OptimisationResult::unsupported(id, "docx"));
        stats.record(&OptimisationResult::failed(id, "boom"));
        stats.record(&OptimisationResult::cancelled(id, "user"));

        assert_eq!(stats.files_processed, 5);
        assert_eq!(stats.files_optimized, 1);
        assert_eq!(stats.files_skipped, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total_bytes_saved, 600);
        assert_eq!(stats.total_original_size, 1500);
        assert!((stats.overall_reduction_percent() - 40.0).abs() < 1e-9);
        assert!(!stats.is_clean());
    }

    #[test]
    fn test_summary_mentions_counts() {
        let mut stats = OptimizationStats::new();
        stats.add_optimized(2048, 1024);
        let summary = stats.format_summary();
        assert!(summary.contains("Optimized: 1"));
        assert!(summary.contains("1.00 KB"));
        assert!(stats.is_clean());
    }

    #[test]
    fn test_hidden_manager_counts() {
        let manager = ProgressManager::hidden(3);
        manager.update("one");
        manager.update("two");
        assert_eq!(manager.position(), 2);
    }
}
