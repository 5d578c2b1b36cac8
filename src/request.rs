//! # Request / Progress / Result Types
//!
//! Value object immutabili che descrivono un'unità di lavoro, il suo progresso
//! in streaming e il suo esito terminale.
//!
//! ## Responsabilità:
//! - `RequestId`: token opaco e univoco (UUID v4)
//! - `ItemType`: famiglia di media, usata dal coordinator per scegliere l'optimiser
//! - `OptimisationRequest`: sorgente + metadata, immutabile dopo la costruzione
//! - `OptimisationProgress`: percentuale (0-100) con messaggio opzionale
//! - `OptimisationResult`: esito terminale, prodotto una sola volta per richiesta
//!
//! ## Ciclo di vita:
//! ```text
//! creata -> accodata -> optimiser scelto per ItemType -> Plan -> Toolchain
//!        -> Progress (0..N) -> Result -> evento di completamento
//! ```

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Opaque unique identifier of one optimisation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Forma corta per i log, l'id completo resta nel JSON
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// Media family of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Image,
    Video,
    Pdf,
    Document,
    Unknown,
}

impl ItemType {
    /// Guess the item type from the file extension (case-insensitive)
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return Self::Unknown,
        };

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tif" | "tiff" => Self::Image,
            "mp4" | "mov" | "m4v" | "mkv" | "webm" | "avi" | "mpg" | "mpeg" | "wmv" | "flv" => {
                Self::Video
            }
            "pdf" => Self::Pdf,
            "doc" | "docx" | "odt" | "rtf" | "txt" | "ppt" | "pptx" | "xls" | "xlsx" => {
                Self::Document
            }
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Image => "image",
            ItemType::Video => "video",
            ItemType::Pdf => "pdf",
            ItemType::Document => "document",
            ItemType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisationRequest {
    id: RequestId,
    item_type: ItemType,
    source: PathBuf,
    metadata: Metadata,
}

impl OptimisationRequest {
    /// Create a request with an empty metadata map
    pub fn new(item_type: ItemType, source: impl Into<PathBuf>) -> Self {
        Self::with_metadata(item_type, source, Metadata::new())
    }

    /// Create a request carrying per-request overrides
    pub fn with_metadata(item_type: ItemType, source: impl Into<PathBuf>, metadata: Metadata) -> Self {
        Self {
            id: RequestId::new(),
            item_type,
            source: source.into(),
            metadata,
        }
    }

    /// Create a request whose item type is sniffed from the extension
    pub fn for_path(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        Self::new(ItemType::from_path(&source), source)
    }

    /// Builder-style metadata insertion, consuming the request before it is shared
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Streaming progress for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisationProgress {
    pub request_id: RequestId,
    /// Always within [0, 100]
    pub percentage: f64,
    pub message: Option<String>,
}

impl OptimisationProgress {
    pub fn new(request_id: RequestId, percentage: f64, message: Option<String>) -> Self {
        let percentage = if percentage.is_nan() { 0.0 } else { percentage.clamp(0.0, 100.0) };
        Self {
            request_id,
            percentage,
            message,
        }
    }
}

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimisationStatus {
    Succeeded,
    Failed,
    Cancelled,
    Unsupported,
}

impl OptimisationStatus {
    /// Succeeded and Unsupported complete normally, the rest are failures
    pub fn is_completion(&self) -> bool {
        matches!(self, OptimisationStatus::Succeeded | OptimisationStatus::Unsupported)
    }
}

/// Terminal outcome. Exactly one per accepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisationResult {
    pub request_id: RequestId,
    pub status: OptimisationStatus,
    pub output_path: Option<PathBuf>,
    pub message: Option<String>,
    pub duration: Option<Duration>,
    pub original_size: Option<u64>,
    pub optimised_size: Option<u64>,
}

impl OptimisationResult {
    fn with_status(request_id: RequestId, status: OptimisationStatus, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            output_path: None,
            message: Some(message.into()),
            duration: None,
            original_size: None,
            optimised_size: None,
        }
    }

    pub fn succeeded(request_id: RequestId, output_path: PathBuf, message: impl Into<String>) -> Self {
        let mut result = Self::with_status(request_id, OptimisationStatus::Succeeded, message);
        result.output_path = Some(output_path);
        result
    }

    pub fn failed(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::with_status(request_id, OptimisationStatus::Failed, message)
    }

    pub fn cancelled(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::with_status(request_id, OptimisationStatus::Cancelled, message)
    }

    pub fn unsupported(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::with_status(request_id, OptimisationStatus::Unsupported, message)
    }

    pub fn with_sizes(mut self, original: u64, optimised: u64) -> Self {
        self.original_size = Some(original);
        self.optimised_size = Some(optimised);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OptimisationStatus::Succeeded
    }
}
