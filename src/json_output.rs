//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per i consumatori programmatici.
//!
//! ## Responsabilità:
//! - Emette un messaggio JSON per riga su stdout (`--json`)
//! - Traduce gli eventi del coordinator in messaggi stabili
//!
//! ## Tipi di messaggi:
//! - `start`: Inizio del batch
//! - `file_start`: Richiesta accodata
//! - `file_progress`: Progresso di una richiesta
//! - `file_complete`: Esito terminale di una richiesta
//! - `complete`: Fine del batch con statistiche finali
//! - `error`: Errore generale

use crate::coordinator::CoordinatorEvent;
use crate::progress::OptimizationStats;
use crate::request::{ItemType, OptimisationResult, OptimisationStatus, RequestId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tipo di messaggio JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonMessage {
    /// Inizio del batch
    Start { total_files: usize, workers: usize },

    /// Richiesta accettata dal coordinator
    FileStart {
        request_id: RequestId,
        path: PathBuf,
        item_type: ItemType,
    },

    FileProgress {
        request_id: RequestId,
        percentage: f64,
        message: Option<String>,
    },

    /// Esito terminale di una richiesta
    FileComplete {
        request_id: RequestId,
        status: OptimisationStatus,
        output_path: Option<PathBuf>,
        original_size: Option<u64>,
        optimised_size: Option<u64>,
        duration_seconds: Option<f64>,
        message: Option<String>,
    },

    /// Batch completato
    Complete {
        files_processed: usize,
        files_optimized: usize,
        files_skipped: usize,
        errors: usize,
        cancelled: usize,
        total_bytes_saved: u64,
        average_reduction: f64,
        duration_seconds: f64,
    },

    /// Errore generale
    Error { message: String, details: Option<String> },
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn start(total_files: usize, workers: usize) -> Self {
        Self::Start { total_files, workers }
    }

    pub fn file_start(request_id: RequestId, path: PathBuf, item_type: ItemType) -> Self {
        Self::FileStart {
            request_id,
            path,
            item_type,
        }
    }

    pub fn file_complete(result: &OptimisationResult) -> Self {
        Self::FileComplete {
            request_id: result.request_id,
            status: result.status,
            output_path: result.output_path.clone(),
            original_size: result.original_size,
            optimised_size: result.optimised_size,
            duration_seconds: result.duration.map(|d| d.as_secs_f64()),
            message: result.message.clone(),
        }
    }

    /// Crea un messaggio di completamento generale
    pub fn complete(stats: &OptimizationStats, duration_seconds: f64) -> Self {
        Self::Complete {
            files_processed: stats.files_processed,
            files_optimized: stats.files_optimized,
            files_skipped: stats.files_skipped,
            errors: stats.errors,
            cancelled: stats.cancelled,
            total_bytes_saved: stats.total_bytes_saved,
            average_reduction: stats.overall_reduction_percent(),
            duration_seconds,
        }
    }

    pub fn error(message: String, details: Option<String>) -> Self {
        Self::Error { message, details }
    }
}

impl From<&CoordinatorEvent> for JsonMessage {
    fn from(event: &CoordinatorEvent) -> Self {
        match event {
            CoordinatorEvent::ProgressChanged(progress) => Self::FileProgress {
                request_id: progress.request_id,
                percentage: progress.percentage,
                message: progress.message.clone(),
            },
            CoordinatorEvent::RequestCompleted(result) | CoordinatorEvent::RequestFailed(result) => {
                Self::file_complete(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OptimisationProgress;
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn test_messages_are_tagged() {
        let json = serde_json::to_value(JsonMessage::start(4, 2)).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["total_files"], 4);
    }

    #[test]
    fn test_progress_event_conversion() {
        let id = RequestId::new();
        let event = CoordinatorEvent::ProgressChanged(OptimisationProgress::new(id, 42.5, None));
        let json = serde_json::to_value(JsonMessage::from(&event)).unwrap();
        assert_eq!(json["type"], "file_progress");
        assert_eq!(json["percentage"], 42.5);
        assert_eq!(json["message"], Value::Null);
    }

    #[test]
    fn test_completion_carries_status_and_sizes() {
        let id = RequestId::new();
        let result = OptimisationResult::succeeded(id, PathBuf::from("/m/a.optimised.jpg"), "ok")
            .with_sizes(100, 40)
            .with_duration(Duration::from_millis(1500));
        let event = CoordinatorEvent::RequestCompleted(result);

        let json = serde_json::to_value(JsonMessage::from(&event)).unwrap();
        assert_eq!(json["type"], "file_complete");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["optimised_size"], 40);
        assert_eq!(json["duration_seconds"], 1.5);
    }

    #[test]
    fn test_round_trip_error() {
        let message = JsonMessage::error("no input".to_string(), Some("empty".to_string()));
        let text = serde_json::to_string(&message).unwrap();
        assert_eq!(serde_json::from_str::<JsonMessage>(&text).unwrap(), message);
    }
}
