//! # Error Types Module
//!
//! Questo modulo definisce i tipi di errore del motore di ottimizzazione.
//!
//! ## Responsabilità:
//! - Definisce `OptimizeError` enum per categorizzare gli errori del core
//! - Distingue gli errori che diventano `Failed` dalla cancellazione, l'unico
//!   errore che può risalire fino al coordinator
//! - Integra con `thiserror` per automatic error conversion
//!
//! ## Categorie di errori:
//! - `Io`: Errori di I/O (permessi, disco pieno, etc.)
//! - `Image`: Errori di decodifica/codifica immagini
//! - `SourceMissing`: File sorgente inesistente
//! - `InvalidPdf` / `EncryptedPdf`: Validazione PDF fallita
//! - `Validation`: Errori di validazione input/output
//! - `Cancelled`: Richiesta cancellata (cooperativa)
//!
//! ## Esempio:
//! ```rust,ignore
//! if ctx.is_cancelled() {
//!     return Err(OptimizeError::Cancelled("shutdown".to_string()));
//! }
//! ```

use std::path::PathBuf;

/// Custom error types for media optimisation
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Source file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Invalid PDF: {0}")]
    InvalidPdf(String),

    #[error("PDF is encrypted: {}", .0.display())]
    EncryptedPdf(PathBuf),

    #[error("File validation error: {0}")]
    Validation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl OptimizeError {
    /// True when this error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OptimizeError::Cancelled(_))
    }
}

/// Result alias used across the engine core
pub type Result<T> = std::result::Result<T, OptimizeError>;
