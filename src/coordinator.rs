//! # Coordinator
//!
//! Scheduler a parallelismo limitato: accetta richieste, le instrada
//! all'optimiser giusto e garantisce un solo esito terminale per richiesta.
//!
//! ## Responsabilità:
//! - Coda FIFO (mpsc) svuotata da un dispatcher con un pool fisso di slot (`Semaphore`)
//! - Registry delle richieste in corso: chi rimuove l'entry consegna il risultato
//! - Cancellazione cooperativa: token per richiesta, figlio del token di shutdown
//! - Eventi `ProgressChanged` / `RequestCompleted` / `RequestFailed` su broadcast
//! - Attesa della stabilizzazione del file per le richieste `automatic`
//!
//! ## Stati di una richiesta:
//! ```text
//! Queued --(slot libero)--> Running --(optimiser)--> rimossa + risultato
//!    \--(cancel)--> rimossa + Cancelled
//! ```
//!
//! `Coordinator::new` va chiamato dentro un runtime tokio.

use crate::error::Result;
use crate::file_manager::FileManager;
use crate::optimizer::Optimiser;
use crate::request::{ItemType, OptimisationProgress, OptimisationRequest, OptimisationResult, OptimisationStatus, RequestId};
use crate::toolchain::{ExecutionContext, ProgressReporter, ProgressSink};
use crate::utils::file_label;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default wait for a freshly written file to stop changing
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Half the cores, never fewer than two slots
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cores / 2).max(2)
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Number of requests allowed to run at the same time
    pub workers: usize,
    pub settle_timeout: Duration,
    /// Parent of the per-request scratch dirs (system temp dir when `None`)
    pub temp_root: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            temp_root: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Notifications published to every subscriber
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    ProgressChanged(OptimisationProgress),
    /// Succeeded or Unsupported
    RequestCompleted(OptimisationResult),
    /// Failed or Cancelled
    RequestFailed(OptimisationResult),
}

impl CoordinatorEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            CoordinatorEvent::ProgressChanged(progress) => progress.request_id,
            CoordinatorEvent::RequestCompleted(result) | CoordinatorEvent::RequestFailed(result) => result.request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CoordinatorEvent::ProgressChanged(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    Running,
}

/// Snapshot entry returned by `Coordinator::pending_requests`
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: RequestId,
    pub item_type: ItemType,
    pub source: PathBuf,
    pub state: RequestState,
    pub waited: Duration,
}

/// Handle to an enqueued request, resolving to its terminal result
pub struct Ticket {
    id: RequestId,
    receiver: oneshot::Receiver<OptimisationResult>,
}

impl Ticket {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for Ticket {
    type Output = OptimisationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.receiver).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| OptimisationResult::cancelled(id, "coordinator dropped the request"))
        })
    }
}

struct Entry {
    seq: u64,
    item_type: ItemType,
    source: PathBuf,
    state: RequestState,
    enqueued_at: Instant,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
    reply: oneshot::Sender<OptimisationResult>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<RequestId, Entry>,
    next_seq: u64,
}

struct Shared {
    registry: Mutex<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    optimisers: Vec<Arc<dyn Optimiser>>,
    options: CoordinatorOptions,
    shutdown: CancellationToken,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queued -> Running. `None` when the request was cancelled meanwhile.
    fn mark_running(&self, id: RequestId) -> Option<CancellationToken> {
        let mut registry = self.registry();
        let entry = registry.entries.get_mut(&id)?;
        if entry.state != RequestState::Queued {
            return None;
        }
        entry.state = RequestState::Running;
        Some(entry.cancel.clone())
    }

    /// Remove the entry and deliver `result`. Only the first caller delivers.
    fn finalize(&self, id: RequestId, mut result: OptimisationResult) -> bool {
        let entry = self.registry().entries.remove(&id);
        match entry {
            Some(mut entry) => {
                // Il motivo passato a `cancel` prevale sul messaggio del toolchain
                if result.status == OptimisationStatus::Cancelled {
                    if let Some(reason) = entry.cancel_reason.take() {
                        result.message = Some(reason);
                    }
                }
                self.deliver(entry, result);
                true
            }
            None => {
                debug!("Request {} already finalized, dropping late result", id);
                false
            }
        }
    }

    fn deliver(&self, entry: Entry, result: OptimisationResult) {
        let event = if result.status.is_completion() {
            CoordinatorEvent::RequestCompleted(result.clone())
        } else {
            CoordinatorEvent::RequestFailed(result.clone())
        };
        if self.events.send(event).is_err() {
            debug!("No subscribers for result of {}", result.request_id);
        }
        if entry.reply.send(result).is_err() {
            debug!("Ticket for {} was dropped before completion", entry.source.display());
        }
    }

    /// Resolve everything still registered as cancelled
    fn drain(&self, reason: &str) {
        let leftovers: Vec<(RequestId, Entry)> = self.registry().entries.drain().collect();
        for (id, entry) in leftovers {
            entry.cancel.cancel();
            self.deliver(entry, OptimisationResult::cancelled(id, reason));
        }
    }

    fn progress_sink(&self) -> ProgressSink {
        let events = self.events.clone();
        Arc::new(move |progress| {
            // Nessun subscriber non è un errore
            let _ = events.send(CoordinatorEvent::ProgressChanged(progress));
        })
    }
}

/// Bounded-parallelism scheduler over a set of optimisers
pub struct Coordinator {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<OptimisationRequest>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(optimisers: Vec<Arc<dyn Optimiser>>, options: CoordinatorOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (queue, receiver) = mpsc::unbounded_channel();
        info!(
            "🚀 Coordinator started: {} worker slots, {} optimisers",
            options.workers.max(1),
            optimisers.len()
        );
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            events,
            optimisers,
            options,
            shutdown: CancellationToken::new(),
        });
        let dispatcher = tokio::spawn(dispatch(shared.clone(), receiver));

        Self {
            shared,
            queue,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Accept a request into the queue. Never blocks.
    pub fn enqueue(&self, request: OptimisationRequest) -> Ticket {
        let id = request.id();
        let (reply, receiver) = oneshot::channel();
        let ticket = Ticket { id, receiver };

        {
            let mut registry = self.shared.registry();
            if self.shared.shutdown.is_cancelled() {
                let _ = reply.send(OptimisationResult::cancelled(id, "coordinator is shut down"));
                return ticket;
            }
            if registry.entries.contains_key(&id) {
                warn!("⚠️  Request {} enqueued twice", id);
                let _ = reply.send(OptimisationResult::failed(id, "already in flight"));
                return ticket;
            }
            let seq = registry.next_seq;
            registry.next_seq += 1;
            registry.entries.insert(
                id,
                Entry {
                    seq,
                    item_type: request.item_type(),
                    source: request.source().to_path_buf(),
                    state: RequestState::Queued,
                    enqueued_at: Instant::now(),
                    cancel: self.shared.shutdown.child_token(),
                    cancel_reason: None,
                    reply,
                },
            );
        }

        debug!("Queued {} ({}, {})", id, request.item_type(), file_label(request.source()));
        if self.queue.send(request).is_err() {
            self.shared.finalize(id, OptimisationResult::cancelled(id, "coordinator is shut down"));
        }
        ticket
    }

    /// Cancel a queued or running request.
    ///
    /// Returns `true` when the request was still pending. A queued request
    /// resolves immediately; a running one is signalled and resolves once its
    /// toolchain has stopped.
    pub fn cancel(&self, id: RequestId, reason: &str) -> bool {
        let mut registry = self.shared.registry();
        let state = match registry.entries.get(&id) {
            Some(entry) => entry.state,
            None => return false,
        };
        match state {
            RequestState::Running => {
                info!("🛑 Cancelling running request {}: {}", id, reason);
                if let Some(entry) = registry.entries.get_mut(&id) {
                    entry.cancel_reason = Some(reason.to_string());
                    entry.cancel.cancel();
                }
            }
            RequestState::Queued => {
                info!("🛑 Cancelling queued request {}: {}", id, reason);
                if let Some(entry) = registry.entries.remove(&id) {
                    drop(registry);
                    entry.cancel.cancel();
                    self.shared.deliver(entry, OptimisationResult::cancelled(id, reason));
                }
            }
        }
        true
    }

    /// Queued and running requests, oldest first
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let registry = self.shared.registry();
        let mut entries: Vec<(&RequestId, &Entry)> = registry.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(id, entry)| PendingRequest {
                id: *id,
                item_type: entry.item_type,
                source: entry.source.clone(),
                state: entry.state,
                waited: entry.enqueued_at.elapsed(),
            })
            .collect()
    }

    /// Receiver for all future events. Dropping it unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    /// Cancel all outstanding work and wait until every ticket is resolved
    pub async fn shutdown(&self) {
        info!("🛑 Coordinator shutting down");
        self.shared.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!("⚠️  Dispatcher task ended abnormally: {}", e);
            }
        }
        self.shared.drain("coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Il dispatcher resta vivo quanto basta per risolvere i ticket
        self.shared.shutdown.cancel();
    }
}

async fn dispatch(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<OptimisationRequest>) {
    let slots = Arc::new(Semaphore::new(shared.options.workers.max(1)));
    let mut workers = JoinSet::new();

    loop {
        let request = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            Some(finished) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = finished {
                    warn!("⚠️  Worker task ended abnormally: {}", e);
                }
                continue;
            }
            next = queue.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let id = request.id();
        let Some(cancel) = shared.mark_running(id) else {
            debug!("Skipping {}: cancelled while queued", id);
            continue;
        };

        let worker_shared = shared.clone();
        workers.spawn(async move {
            // Lo slot resta occupato fino al cleanup completo
            let _permit = permit;
            run_request(worker_shared, request, cancel).await;
        });
    }

    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            warn!("⚠️  Worker task ended abnormally: {}", e);
        }
    }
    shared.drain("coordinator shut down");
}

async fn run_request(shared: Arc<Shared>, request: OptimisationRequest, cancel: CancellationToken) {
    let id = request.id();
    let started = Instant::now();
    let mut ctx = ExecutionContext::new(id, cancel, ProgressReporter::new(id, shared.progress_sink()));
    if let Some(ref root) = shared.options.temp_root {
        ctx = ctx.with_temp_root(root);
    }

    let optimiser = shared.optimisers.iter().find(|o| o.accepts(&request)).cloned();
    let result = match optimiser {
        None => {
            info!("⏭️  No optimiser for {} ({})", file_label(request.source()), request.item_type());
            OptimisationResult::unsupported(id, format!("no optimiser for {} items", request.item_type()))
        }
        Some(optimiser) => {
            info!("▶️  {} -> {} optimiser", file_label(request.source()), optimiser.name());
            let outcome = AssertUnwindSafe(execute(&shared, optimiser.as_ref(), &request, &ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) if e.is_cancelled() => {
                    info!("🛑 {} cancelled", file_label(request.source()));
                    OptimisationResult::cancelled(id, e.to_string())
                }
                Ok(Err(e)) => {
                    warn!("❌ {} failed: {}", file_label(request.source()), e);
                    OptimisationResult::failed(id, e.to_string())
                }
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!("❌ {} optimiser panicked: {}", optimiser.name(), detail);
                    OptimisationResult::failed(id, format!("optimiser panicked: {}", detail))
                }
            }
        }
    };

    let result = if result.duration.is_none() {
        result.with_duration(started.elapsed())
    } else {
        result
    };
    shared.finalize(id, result);
}

async fn execute(
    shared: &Shared,
    optimiser: &dyn Optimiser,
    request: &OptimisationRequest,
    ctx: &ExecutionContext,
) -> Result<OptimisationResult> {
    let automatic = request
        .metadata()
        .get_bool(optimiser.name(), "automatic")
        .unwrap_or(false);
    if automatic {
        let settled =
            FileManager::wait_until_stable(request.source(), shared.options.settle_timeout, &ctx.cancel).await?;
        if !settled {
            debug!(
                "{} did not settle within {:?}, optimising anyway",
                file_label(request.source()),
                shared.options.settle_timeout
            );
        }
    }
    optimiser.optimise(request, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimizeError;
    use crate::request::OptimisationStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Sleep(Duration),
        WaitForCancel,
        Fail,
        Panic,
    }

    struct ScriptedOptimiser {
        family: &'static str,
        item_type: ItemType,
        behaviour: Behaviour,
        active: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedOptimiser {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Self::for_family("scripted", ItemType::Image, behaviour)
        }

        fn for_family(family: &'static str, item_type: ItemType, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                family,
                item_type,
                behaviour,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Optimiser for ScriptedOptimiser {
        fn name(&self) -> &'static str {
            self.family
        }

        fn item_type(&self) -> ItemType {
            self.item_type
        }

        async fn optimise(&self, request: &OptimisationRequest, ctx: &ExecutionContext) -> Result<OptimisationResult> {
            self.order.lock().unwrap().push(request.source().to_path_buf());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            ctx.progress.report(50.0, Some("halfway"));

            let outcome = match self.behaviour {
                Behaviour::Sleep(duration) => {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => Err(OptimizeError::Cancelled("stopped".to_string())),
                        _ = tokio::time::sleep(duration) => Ok(OptimisationResult::succeeded(
                            request.id(),
                            request.source().to_path_buf(),
                            "done",
                        )),
                    }
                }
                Behaviour::WaitForCancel => {
                    ctx.cancel.cancelled().await;
                    Err(OptimizeError::Cancelled("stopped".to_string()))
                }
                Behaviour::Fail => Err(OptimizeError::Validation("encoder exploded".to_string())),
                Behaviour::Panic => panic!("scripted panic"),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn coordinator(optimiser: Arc<ScriptedOptimiser>, workers: usize) -> Coordinator {
        Coordinator::new(
            vec![optimiser as Arc<dyn Optimiser>],
            CoordinatorOptions {
                workers,
                ..CoordinatorOptions::default()
            },
        )
    }

    fn image(name: &str) -> OptimisationRequest {
        OptimisationRequest::new(ItemType::Image, format!("/virtual/{}", name))
    }

    async fn wait_until_running(coordinator: &Coordinator, id: RequestId) {
        for _ in 0..200 {
            if coordinator
                .pending_requests()
                .iter()
                .any(|p| p.id == id && p.state == RequestState::Running)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request {} never started", id);
    }

    #[test]
    fn test_default_workers_floor() {
        assert!(default_workers() >= 2);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let optimiser = ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(60)));
        let coordinator = coordinator(optimiser.clone(), 2);

        let tickets: Vec<Ticket> = (0..6).map(|i| coordinator.enqueue(image(&format!("{}.png", i)))).collect();
        let results = futures::future::join_all(tickets).await;

        assert!(results.iter().all(|r| r.status == OptimisationStatus::Succeeded));
        assert_eq!(optimiser.peak.load(Ordering::SeqCst), 2);
        assert!(coordinator.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_runs_in_fifo_order() {
        let optimiser = ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(5)));
        let coordinator = coordinator(optimiser.clone(), 1);

        let names = ["c.png", "a.png", "d.png", "b.png"];
        let tickets: Vec<Ticket> = names.iter().map(|n| coordinator.enqueue(image(n))).collect();
        futures::future::join_all(tickets).await;

        let expected: Vec<PathBuf> = names.iter().map(|n| PathBuf::from(format!("/virtual/{}", n))).collect();
        assert_eq!(*optimiser.order.lock().unwrap(), expected);
        assert_eq!(optimiser.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let optimiser = ScriptedOptimiser::new(Behaviour::WaitForCancel);
        let coordinator = coordinator(optimiser.clone(), 1);

        let running = coordinator.enqueue(image("running.png"));
        let queued = coordinator.enqueue(image("queued.png"));
        let running_id = running.id();
        let queued_id = queued.id();
        wait_until_running(&coordinator, running_id).await;

        let snapshot = coordinator.pending_requests();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].state, RequestState::Queued);

        assert!(coordinator.cancel(queued_id, "user request"));
        let queued_result = queued.await;
        assert_eq!(queued_result.status, OptimisationStatus::Cancelled);
        assert_eq!(queued_result.message.as_deref(), Some("user request"));

        assert!(coordinator.cancel(running_id, "user request"));
        let running_result = running.await;
        assert_eq!(running_result.status, OptimisationStatus::Cancelled);
        assert_eq!(running_result.message.as_deref(), Some("user request"));

        assert!(!coordinator.cancel(running_id, "again"));
        assert!(!coordinator.cancel(RequestId::new(), "unknown"));
        // La richiesta cancellata in coda non arriva mai all'optimiser
        assert_eq!(optimiser.order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ticket_stays_pending_until_finalized() {
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::WaitForCancel), 1);
        let ticket = coordinator.enqueue(image("slow.png"));
        let id = ticket.id();
        let mut ticket = tokio_test::task::spawn(ticket);

        wait_until_running(&coordinator, id).await;
        tokio_test::assert_pending!(ticket.poll());

        assert!(coordinator.cancel(id, "test"));
        let mut result = None;
        for _ in 0..200 {
            if let Poll::Ready(outcome) = ticket.poll() {
                result = Some(outcome);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(result.unwrap().status, OptimisationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_exactly_one_result_under_racing_cancels() {
        let optimiser = ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(3)));
        let coordinator = Arc::new(coordinator(optimiser, 3));
        let mut events = coordinator.subscribe();

        let tickets: Vec<Ticket> = (0..30).map(|i| coordinator.enqueue(image(&format!("{}.png", i)))).collect();
        let ids: Vec<RequestId> = tickets.iter().map(Ticket::id).collect();

        let canceller = {
            let coordinator = coordinator.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for (i, id) in ids.into_iter().enumerate() {
                    if i % 2 == 0 {
                        coordinator.cancel(id, "race");
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let results = futures::future::join_all(tickets).await;
        canceller.await.unwrap();

        assert_eq!(results.len(), 30);
        let mut terminal: HashMap<RequestId, usize> = HashMap::new();
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                *terminal.entry(event.request_id()).or_default() += 1;
            }
        }
        assert_eq!(terminal.len(), 30);
        assert!(terminal.values().all(|count| *count == 1));
        for (id, result) in ids.iter().zip(&results) {
            assert_eq!(result.request_id, *id);
            assert!(matches!(
                result.status,
                OptimisationStatus::Succeeded | OptimisationStatus::Cancelled
            ));
        }
    }

    #[tokio::test]
    async fn test_unmatched_item_type_is_unsupported() {
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::Fail), 2);
        let mut events = coordinator.subscribe();

        let result = coordinator
            .enqueue(OptimisationRequest::new(ItemType::Document, "/virtual/notes.docx"))
            .await;

        assert_eq!(result.status, OptimisationStatus::Unsupported);
        assert!(result.duration.is_some());
        assert!(matches!(events.recv().await.unwrap(), CoordinatorEvent::RequestCompleted(_)));
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_failed() {
        let failing = coordinator(ScriptedOptimiser::new(Behaviour::Fail), 1);
        let result = failing.enqueue(image("broken.png")).await;
        assert_eq!(result.status, OptimisationStatus::Failed);
        assert!(result.message.unwrap().contains("encoder exploded"));

        let panicking = coordinator(ScriptedOptimiser::new(Behaviour::Panic), 1);
        let mut events = panicking.subscribe();
        let result = panicking.enqueue(image("boom.png")).await;
        assert_eq!(result.status, OptimisationStatus::Failed);
        assert!(result.message.unwrap().contains("scripted panic"));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, CoordinatorEvent::RequestFailed(_));
        }
        assert!(saw_failure);

        // Il coordinator resta operativo dopo un panic
        let again = panicking.enqueue(image("boom2.png")).await;
        assert_eq!(again.status, OptimisationStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_id_does_not_disturb_original() {
        let optimiser = ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(30)));
        let coordinator = coordinator(optimiser, 1);
        let request = image("dup.png");

        let original = coordinator.enqueue(request.clone());
        let duplicate = coordinator.enqueue(request);

        let duplicate_result = duplicate.await;
        assert_eq!(duplicate_result.status, OptimisationStatus::Failed);
        assert_eq!(duplicate_result.message.as_deref(), Some("already in flight"));
        assert_eq!(original.await.status, OptimisationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_progress_precedes_terminal_event() {
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(1))), 1);
        let mut events = coordinator.subscribe();

        let ticket = coordinator.enqueue(image("p.png"));
        let id = ticket.id();
        ticket.await;

        let first = events.recv().await.unwrap();
        assert!(matches!(first, CoordinatorEvent::ProgressChanged(ref p) if p.request_id == id && p.percentage == 50.0));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, CoordinatorEvent::RequestCompleted(ref r) if r.request_id == id));
    }

    #[tokio::test]
    async fn test_shutdown_resolves_every_ticket() {
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::WaitForCancel), 1);
        let tickets: Vec<Ticket> = (0..3).map(|i| coordinator.enqueue(image(&format!("{}.png", i)))).collect();
        wait_until_running(&coordinator, tickets[0].id()).await;

        coordinator.shutdown().await;

        let results = futures::future::join_all(tickets).await;
        assert!(results.iter().all(|r| r.status == OptimisationStatus::Cancelled));
        assert!(coordinator.pending_requests().is_empty());

        let late = coordinator.enqueue(image("late.png")).await;
        assert_eq!(late.status, OptimisationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_dropping_coordinator_resolves_tickets() {
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::WaitForCancel), 1);
        let tickets: Vec<Ticket> = (0..2).map(|i| coordinator.enqueue(image(&format!("{}.png", i)))).collect();
        drop(coordinator);

        let results = futures::future::join_all(tickets).await;
        assert!(results.iter().all(|r| r.status == OptimisationStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_automatic_request_waits_for_settled_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("fresh.png");
        std::fs::write(&source, b"pixels").unwrap();
        let coordinator = coordinator(ScriptedOptimiser::new(Behaviour::Sleep(Duration::from_millis(1))), 1);

        let started = Instant::now();
        let result = coordinator
            .enqueue(OptimisationRequest::new(ItemType::Image, &source).meta("automatic", true))
            .await;

        assert_eq!(result.status, OptimisationStatus::Succeeded);
        assert!(started.elapsed() >= crate::file_manager::SETTLE_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_settle_flag_is_read_under_optimiser_family() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("scan.pdf");
        std::fs::write(&source, b"%PDF-1.4").unwrap();
        let optimiser =
            ScriptedOptimiser::for_family("pdf", ItemType::Document, Behaviour::Sleep(Duration::from_millis(1)));
        let coordinator = coordinator(optimiser, 1);

        let started = Instant::now();
        let result = coordinator
            .enqueue(OptimisationRequest::new(ItemType::Document, &source).meta("pdf.automatic", true))
            .await;

        assert_eq!(result.status, OptimisationStatus::Succeeded);
        assert!(started.elapsed() >= crate::file_manager::SETTLE_POLL_INTERVAL);
    }
}
