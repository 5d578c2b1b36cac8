//! # Media Engine Library
//!
//! Questo è il modulo principale della libreria che espone le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare del motore di ottimizzazione
//! - Espone i tipi principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `coordinator`: Scheduler con parallelismo limitato, cancellazione ed eventi
//! - `optimizer`: Optimiser Image/Video/Pdf e commit dell'output
//! - `plan`: Costruzione dei piani immutabili da Options + metadata
//! - `toolchain`: Esecuzione dei tool esterni, progress tracker, encoder in-process
//! - `tool_resolver`: Ricerca e cache dei path degli eseguibili
//! - `request` / `metadata`: Value object di richiesta, progresso e risultato
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore custom
//! - `file_manager`: Discovery dei media e attesa di stabilizzazione
//! - `progress` / `json_output`: Rendering CLI e output JSON
//!
//! ## Utilizzo:
//! ```rust,no_run
//! use media_engine::{Coordinator, CoordinatorOptions, OptimisationRequest, ToolPathResolver};
//! use media_engine::optimizer::{standard_set, OptimiserOptions};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let optimisers = standard_set(&OptimiserOptions::default(), Arc::new(ToolPathResolver::system()));
//! let coordinator = Coordinator::new(optimisers, CoordinatorOptions::default());
//! let result = coordinator.enqueue(OptimisationRequest::for_path("/media/clip.mov")).await;
//! println!("{:?}: {:?}", result.status, result.message);
//! coordinator.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod file_manager;
pub mod json_output;
pub mod metadata;
pub mod optimizer;
pub mod plan;
pub mod progress;
pub mod request;
pub mod tool_resolver;
pub mod toolchain;
pub mod utils;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorEvent, CoordinatorOptions, PendingRequest, RequestState, Ticket};
pub use error::OptimizeError;
pub use metadata::Metadata;
pub use optimizer::Optimiser;
pub use request::{
    ItemType, OptimisationProgress, OptimisationRequest, OptimisationResult, OptimisationStatus, RequestId,
};
pub use tool_resolver::ToolPathResolver;
