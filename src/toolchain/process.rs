//! # Process Runner
//!
//! Esecuzione supervisionata di un tool esterno.
//!
//! ## Flusso di `run`:
//! 1. Risoluzione del path (cache del `ToolPathResolver`)
//! 2. Spawn in un nuovo process group, stdin chiuso, stdout/stderr in pipe
//! 3. Due task di lettura: le righe terminano sia con `\r` sia con `\n`;
//!    il canale di progresso passa dal tracker, l'altro conserva solo la coda
//! 4. `select!` tra uscita del processo, cancellazione e timeout
//! 5. Alla cancellazione: `killpg(SIGKILL)` sull'intero gruppo, poi reap
//! 6. Join dei lettori prima di ispezionare l'exit status, a sua volta
//!    interrompibile: se le pipe restano aperte oltre `DRAIN_TIMEOUT` il gruppo
//!    viene terminato
//!
//! Se lo spawn fallisce perché l'eseguibile non esiste più, la voce in cache
//! viene invalidata e il tool ri-risolto: al massimo `MAX_SPAWN_ATTEMPTS` tentativi.

use super::progress::{ProgressReporter, ProgressTracker};
use super::{ExecutionContext, ToolchainResult};
use crate::error::{OptimizeError, Result};
use crate::tool_resolver::ToolPathResolver;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const MAX_SPAWN_ATTEMPTS: u32 = 2;

/// Lines of non-progress output kept for error messages
const TAIL_LINES: usize = 20;

/// Wait for the output pipes to close once the tool has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// One external command: logical tool name plus its ordered arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Vec<String>,
    /// Channel whose lines feed the progress tracker
    pub progress_channel: OutputChannel,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
            progress_channel: OutputChannel::Stderr,
            working_dir: None,
            timeout: None,
        }
    }

    pub fn progress_on(mut self, channel: OutputChannel) -> Self {
        self.progress_channel = channel;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line for log messages
    pub fn command_line(&self) -> String {
        let mut line = self.tool.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push_str(&format!("\"{}\"", arg));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Destination of the lines read from one output channel
struct LineSink {
    tracker: Option<Box<dyn ProgressTracker>>,
    reporter: ProgressReporter,
    tail: VecDeque<String>,
}

impl LineSink {
    fn new(tracker: Option<Box<dyn ProgressTracker>>, reporter: ProgressReporter) -> Self {
        Self {
            tracker,
            reporter,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        trace!("[{}] {}", self.reporter.request_id(), line);
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.track(line, &self.reporter);
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    fn tail_text(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Read `stream` to EOF, splitting on both `\r` and `\n`
async fn pump<R>(stream: Option<R>, mut sink: LineSink) -> LineSink
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return sink;
    };
    let mut chunk = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        };
        for &byte in &chunk[..read] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    sink.push(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        sink.push(&String::from_utf8_lossy(&pending));
    }
    sink
}

enum Exit {
    Status(io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

enum Drain {
    Joined(Option<LineSink>),
    Cancelled,
    Stalled,
}

/// Joins the output readers after the tool has exited.
///
/// A background child of the tool can keep the pipes open: after `DRAIN_TIMEOUT`
/// the whole process group is killed and the readers get one more grace period.
async fn drain_readers(
    mut tasks: [JoinHandle<LineSink>; 2],
    pid: Option<u32>,
    tool: &str,
    cancel: &CancellationToken,
) -> Result<[Option<LineSink>; 2]> {
    let mut sinks: [Option<LineSink>; 2] = [None, None];
    let mut deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    let mut group_killed = false;

    for i in 0..tasks.len() {
        loop {
            let outcome = tokio::select! {
                joined = &mut tasks[i] => Drain::Joined(joined.ok()),
                _ = cancel.cancelled() => Drain::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Drain::Stalled,
            };
            match outcome {
                Drain::Joined(sink) => {
                    sinks[i] = sink;
                    break;
                }
                Drain::Cancelled => {
                    info!("🛑 Cancelling {} while its output is still open", tool);
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    for task in &tasks[i..] {
                        task.abort();
                    }
                    return Err(OptimizeError::Cancelled(format!("{} cancelled", tool)));
                }
                Drain::Stalled if !group_killed => {
                    warn!(
                        "⚠️  {} exited but its output is still open after {:?}, killing leftover processes",
                        tool, DRAIN_TIMEOUT
                    );
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    group_killed = true;
                    deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                }
                Drain::Stalled => {
                    for task in &tasks[i..] {
                        task.abort();
                    }
                    break;
                }
            }
        }
    }
    Ok(sinks)
}

/// Spawns and supervises external tools
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    resolver: Arc<ToolPathResolver>,
}

impl ProcessRunner {
    pub fn new(resolver: Arc<ToolPathResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ToolPathResolver {
        &self.resolver
    }

    /// Run `invocation` to completion.
    ///
    /// Returns `Err` only for cancellation; every other failure (missing tool,
    /// non-zero exit, timeout) is a failed `ToolchainResult`.
    pub async fn run(
        &self,
        invocation: &ToolInvocation,
        tracker: Box<dyn ProgressTracker>,
        ctx: &ExecutionContext,
    ) -> Result<ToolchainResult> {
        let tool = invocation.tool.as_str();

        for attempt in 1..=MAX_SPAWN_ATTEMPTS {
            ctx.check_cancelled()?;

            let Some(program) = self.resolver.resolve(tool) else {
                if attempt < MAX_SPAWN_ATTEMPTS {
                    debug!("{} not found (attempt {}), searching again", tool, attempt);
                    continue;
                }
                break;
            };

            match Self::spawn(&program, invocation) {
                Ok(child) => {
                    debug!("Spawned {} (pid {:?}): {}", tool, child.id(), invocation.command_line());
                    return self.supervise(child, invocation, tracker, ctx).await;
                }
                Err(e) if attempt < MAX_SPAWN_ATTEMPTS && Self::is_stale(&e, &program) => {
                    warn!(
                        "⚠️  {} could not be started from {:?} ({}), re-resolving",
                        tool, program, e
                    );
                    self.resolver.invalidate(tool);
                }
                Err(e) => {
                    return Ok(ToolchainResult::failed(format!("failed to start {}: {}", tool, e)));
                }
            }
        }

        Ok(ToolchainResult::failed(format!(
            "{} not found (install with: {})",
            tool,
            ToolPathResolver::install_hint(tool)
        )))
    }

    /// The cached location no longer points at an executable file
    fn is_stale(error: &io::Error, program: &Path) -> bool {
        error.kind() == io::ErrorKind::NotFound || !program.is_file()
    }

    fn spawn(program: &Path, invocation: &ToolInvocation) -> io::Result<Child> {
        let mut command = Command::new(program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = invocation.working_dir {
            command.current_dir(dir);
        }
        // Gruppo dedicato: killpg raggiunge anche i processi figli del tool
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }

    async fn supervise(
        &self,
        mut child: Child,
        invocation: &ToolInvocation,
        tracker: Box<dyn ProgressTracker>,
        ctx: &ExecutionContext,
    ) -> Result<ToolchainResult> {
        let started = Instant::now();
        let pid = child.id();
        let progress_sink = LineSink::new(Some(tracker), ctx.progress.clone());
        let other_sink = LineSink::new(None, ctx.progress.clone());
        let (stdout_sink, stderr_sink) = match invocation.progress_channel {
            OutputChannel::Stdout => (progress_sink, other_sink),
            OutputChannel::Stderr => (other_sink, progress_sink),
        };
        let stdout_task = tokio::spawn(pump(child.stdout.take(), stdout_sink));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), stderr_sink));

        let deadline = async {
            match invocation.timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = ctx.cancel.cancelled() => Exit::Cancelled,
            limit = deadline => Exit::TimedOut(limit),
        };

        let status = match exit {
            Exit::Status(status) => status,
            Exit::Cancelled => {
                info!("🛑 Cancelling {} for request {}", invocation.tool, ctx.request_id);
                terminate_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(OptimizeError::Cancelled(format!("{} cancelled", invocation.tool)));
            }
            Exit::TimedOut(limit) => {
                warn!("⏱️  {} timed out after {:?}", invocation.tool, limit);
                terminate_tree(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Ok(ToolchainResult::failed(format!(
                    "{} timed out after {}s",
                    invocation.tool,
                    limit.as_secs()
                )));
            }
        };

        // Tutte le righe devono essere consumate prima di leggere l'exit status
        let [stdout_sink, stderr_sink] =
            drain_readers([stdout_task, stderr_task], pid, &invocation.tool, &ctx.cancel).await?;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Ok(ToolchainResult::failed(format!(
                    "failed waiting for {}: {}",
                    invocation.tool, e
                )))
            }
        };

        let (progress_sink, other_sink) = match invocation.progress_channel {
            OutputChannel::Stdout => (stdout_sink, stderr_sink),
            OutputChannel::Stderr => (stderr_sink, stdout_sink),
        };

        if status.success() {
            if let Some(mut sink) = progress_sink {
                if let Some(tracker) = sink.tracker.as_mut() {
                    tracker.finish(&sink.reporter);
                }
            }
            debug!(
                "{} finished in {:.1}s",
                invocation.tool,
                started.elapsed().as_secs_f64()
            );
            return Ok(ToolchainResult::ok());
        }

        let tail = other_sink
            .map(|sink| sink.tail_text())
            .filter(|text| !text.is_empty())
            .or_else(|| progress_sink.map(|sink| sink.tail_text()))
            .unwrap_or_default();
        warn!("❌ {} exited with {}", invocation.tool, status);
        Ok(ToolchainResult::failed(if tail.is_empty() {
            format!("{} exited with {}", invocation.tool, status)
        } else {
            format!("{} exited with {}: {}", invocation.tool, status, tail)
        }))
    }
}

/// Kill the whole process group, then reap the direct child
async fn terminate_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!("Child kill after group kill: {}", e);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
