//! # Media Engine - Main Entry Point
//!
//! Questo è il punto di ingresso della CLI, un front-end sottile sopra il coordinator.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del logging con `tracing` (su stderr, stdout resta per il JSON)
//! - Caricamento della configurazione e applicazione degli override CLI
//! - Discovery dei file, accodamento delle richieste e rendering degli eventi
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, `RUST_LOG` vince)
//! 3. Carica `Config` dal file indicato o dal path di default
//! 4. Cerca i file media nei path indicati
//! 5. Accoda una richiesta per file e attende tutti i ticket (Ctrl-C cancella tutto)
//! 6. Exit code 0 solo se nessuna richiesta è fallita
//!
//! ## Esempio di utilizzo:
//! ```bash
//! media-engine ~/Videos ~/Scans/report.pdf --workers 4 --lossy-pdf --meta video.fps=30
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use media_engine::coordinator::{Coordinator, CoordinatorEvent};
use media_engine::file_manager::FileManager;
use media_engine::json_output::JsonMessage;
use media_engine::metadata::Metadata;
use media_engine::optimizer::standard_set;
use media_engine::progress::{OptimizationStats, ProgressManager};
use media_engine::request::{ItemType, OptimisationRequest, RequestId};
use media_engine::utils::file_label;
use media_engine::Config;

#[derive(Parser)]
#[command(name = "media-engine")]
#[command(about = "Optimise images, videos and PDFs with external encoders")]
struct Args {
    /// Files or directories to optimise
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Replace originals instead of writing marked copies
    #[arg(long)]
    replace: bool,

    /// Filename marker for optimised copies (<stem>.<marker>.<ext>)
    #[arg(long)]
    marker: Option<String>,

    /// Keep outputs even when they are not smaller than the source
    #[arg(long)]
    keep_larger: bool,

    /// Use lossy PDF compression (image downsampling)
    #[arg(long)]
    lossy_pdf: bool,

    /// Export videos as animated GIFs
    #[arg(long)]
    gif: bool,

    /// Per-request metadata override, e.g. video.fps=30 (repeatable)
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    meta: Vec<String>,

    /// Output progress and status as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// CLI flags win over the config file
    fn apply_to(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.replace {
            config.output.replace_in_place = true;
        }
        if let Some(ref marker) = self.marker {
            config.output.marker = marker.clone();
        }
        if self.keep_larger {
            config.image.require_smaller_output = false;
            config.video.require_smaller_output = false;
            config.pdf.require_smaller_output = false;
        }
        if self.lossy_pdf {
            config.pdf.lossy = true;
        }
        if self.json {
            config.json_output = true;
        }
    }

    fn request_metadata(&self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        if self.gif {
            metadata.insert("video.mode", "gif");
        }
        for pair in &self.meta {
            let (key, value) =
                Metadata::parse_pair(pair).with_context(|| format!("Invalid --meta value (expected key=value): {}", pair))?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose {
        "debug"
    } else if json {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(FileManager::find_media_files(path));
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(anyhow::anyhow!("Path does not exist: {}", path.display()));
        }
    }
    Ok(files)
}

/// Draw coordinator events until the channel closes
async fn render_events(
    mut events: tokio::sync::broadcast::Receiver<CoordinatorEvent>,
    labels: HashMap<RequestId, String>,
    progress: ProgressManager,
    json: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Renderer skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if json {
            JsonMessage::from(&event).emit();
            continue;
        }

        let label = labels
            .get(&event.request_id())
            .cloned()
            .unwrap_or_else(|| event.request_id().to_string());
        match event {
            CoordinatorEvent::ProgressChanged(p) => {
                progress.set_message(&format!("⏳ {}: {:.0}%", label, p.percentage));
            }
            CoordinatorEvent::RequestCompleted(result) => {
                let detail = result.message.unwrap_or_default();
                progress.update(&format!("✅ {}: {}", label, detail));
            }
            CoordinatorEvent::RequestFailed(result) => {
                let detail = result.message.unwrap_or_default();
                progress.println(&format!("❌ {} ({:?}): {}", label, result.status, detail));
                progress.update(&format!("❌ {}", label));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose, args.json);

    let config_path = args.config.clone().or_else(Config::default_path);
    let mut config = match config_path {
        Some(ref path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    args.apply_to(&mut config);
    config.validate()?;
    let metadata = args.request_metadata()?;

    let files = collect_files(&args.paths)?;
    if files.is_empty() {
        if config.json_output {
            JsonMessage::error("No media files found".to_string(), None).emit();
        } else {
            info!("No media files found to process");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let resolver = Arc::new(config.tool_resolver());
    debug!("{}", resolver.tools_report());

    let started = Instant::now();
    let requests: Vec<OptimisationRequest> = files
        .into_iter()
        .map(|path| OptimisationRequest::with_metadata(ItemType::from_path(&path), path, metadata.clone()))
        .collect();
    let labels: HashMap<RequestId, String> = requests
        .iter()
        .map(|request| (request.id(), file_label(request.source())))
        .collect();

    info!("🚀 Optimising {} files with {} workers", requests.len(), config.workers);
    let progress = if config.json_output {
        JsonMessage::start(requests.len(), config.workers).emit();
        ProgressManager::hidden(requests.len() as u64)
    } else {
        ProgressManager::new(requests.len() as u64)
    };

    let coordinator = Coordinator::new(
        standard_set(&config.optimiser_options(), resolver),
        config.coordinator_options(),
    );
    let renderer = tokio::spawn(render_events(
        coordinator.subscribe(),
        labels,
        progress.clone(),
        config.json_output,
    ));

    let mut tickets = Vec::with_capacity(requests.len());
    for request in requests {
        if config.json_output {
            JsonMessage::file_start(request.id(), request.source().to_path_buf(), request.item_type()).emit();
        }
        tickets.push(coordinator.enqueue(request));
    }

    let all = futures::future::join_all(tickets);
    tokio::pin!(all);
    let results = tokio::select! {
        results = &mut all => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted, cancelling outstanding work");
            coordinator.shutdown().await;
            all.await
        }
    };

    coordinator.shutdown().await;
    drop(coordinator);
    if let Err(e) = renderer.await {
        warn!("⚠️  Event renderer ended abnormally: {}", e);
    }

    let mut stats = OptimizationStats::new();
    for result in &results {
        stats.record(result);
    }

    if config.json_output {
        JsonMessage::complete(&stats, started.elapsed().as_secs_f64()).emit();
    } else {
        progress.finish(&stats.format_summary());
        info!("🏁 Done in {:.1}s: {}", started.elapsed().as_secs_f64(), stats.format_summary());
    }

    Ok(if stats.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
