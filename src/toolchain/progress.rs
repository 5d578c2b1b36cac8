//! # Progress Trackers
//!
//! Parser line-oriented che convertono l'output testuale dei tool esterni in
//! percentuali normalizzate 0-100.
//!
//! ## Responsabilità:
//! - `ProgressReporter`: punto unico di emissione, fa clamp a [0,100] e non
//!   regredisce mai per la stessa richiesta (anche tra stage diversi)
//! - `FfmpegProgressTracker`: header `Duration:` come denominatore, poi
//!   `out_time_us=` / `out_time=` / `time=`; cap a 99% fino a `progress=end`
//! - `GhostscriptProgressTracker`: `Processing pages N through M.` e `Page K`;
//!   cap a 99% fino all'uscita con successo
//! - `GifskiProgressTracker`: marker `frame K / N` convertiti direttamente in rapporto
//!
//! Le righe arrivano nell'ordine di lettura e i report vengono emessi nello
//! stesso ordine.

use crate::request::{OptimisationProgress, RequestId};
use regex::Regex;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Callback receiving normalised progress events
pub type ProgressSink = Arc<dyn Fn(OptimisationProgress) + Send + Sync>;

/// Highest percentage a tracker reports before the tool signals completion
const PRE_COMPLETION_CAP: f64 = 99.0;

/// Clamped, non-regressing progress emitter for one request.
///
/// Clones and stages share the same high-water mark, so a multi-stage pipeline
/// (frame extraction, then frame assembly) still reports a single
/// non-decreasing sequence.
#[derive(Clone)]
pub struct ProgressReporter {
    request_id: RequestId,
    sink: ProgressSink,
    high_water: Arc<Mutex<f64>>,
    offset: f64,
    span: f64,
}

impl ProgressReporter {
    pub fn new(request_id: RequestId, sink: ProgressSink) -> Self {
        Self {
            request_id,
            sink,
            high_water: Arc::new(Mutex::new(0.0)),
            offset: 0.0,
            span: 100.0,
        }
    }

    /// Reporter that drops every event
    pub fn noop(request_id: RequestId) -> Self {
        Self::new(request_id, Arc::new(|_| {}))
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Sub-reporter mapping its own 0..100 onto `[start, end]` of this reporter's range
    pub fn stage(&self, start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 100.0);
        let end = end.clamp(start, 100.0);
        Self {
            request_id: self.request_id,
            sink: self.sink.clone(),
            high_water: self.high_water.clone(),
            offset: self.offset + self.span * start / 100.0,
            span: self.span * (end - start) / 100.0,
        }
    }

    /// Report a percentage in this reporter's own 0..100 scale
    pub fn report(&self, percentage: f64, message: Option<&str>) {
        if percentage.is_nan() {
            return;
        }
        let mapped = (self.offset + self.span * percentage.clamp(0.0, 100.0) / 100.0).clamp(0.0, 100.0);

        let mut high_water = self.high_water.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if mapped < *high_water {
            return;
        }
        *high_water = mapped;
        // Emissione sotto lock: l'ordine dei report segue l'ordine delle righe
        (self.sink)(OptimisationProgress::new(
            self.request_id,
            mapped,
            message.map(str::to_string),
        ));
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("request_id", &self.request_id)
            .field("offset", &self.offset)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

/// Line-oriented progress parser for one tool invocation
pub trait ProgressTracker: Send {
    /// Handle one output line, in arrival order
    fn track(&mut self, line: &str, reporter: &ProgressReporter);

    /// Called once the tool exited successfully
    fn finish(&mut self, reporter: &ProgressReporter) {
        reporter.report(100.0, None);
    }
}

/// Tracker for tools without parseable progress output
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressTracker for NoProgress {
    fn track(&mut self, _line: &str, _reporter: &ProgressReporter) {}
}

fn clock_to_seconds(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let h: f64 = hours.parse().ok()?;
    let m: f64 = minutes.parse().ok()?;
    let s: f64 = seconds.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex"))
}

fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex"))
}

/// ffmpeg tracker for `-progress pipe:2` output (also accepts the classic stats line)
#[derive(Debug, Clone)]
pub struct FfmpegProgressTracker {
    /// Output duration in seconds (source duration divided by speed)
    total_seconds: Option<f64>,
    speed: f64,
}

impl FfmpegProgressTracker {
    /// `known_duration` seeds the denominator; otherwise the first `Duration:` header is used.
    /// `speed` is the playback speed factor applied by the filter chain.
    pub fn new(known_duration: Option<f64>, speed: f64) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        Self {
            total_seconds: known_duration.filter(|d| *d > 0.0).map(|d| d / speed),
            speed,
        }
    }

    pub fn total_seconds(&self) -> Option<f64> {
        self.total_seconds
    }

    fn report_elapsed(&self, elapsed: f64, reporter: &ProgressReporter) {
        if let Some(total) = self.total_seconds {
            let percentage = (elapsed / total * 100.0).min(PRE_COMPLETION_CAP);
            reporter.report(percentage, None);
        }
    }
}

impl ProgressTracker for FfmpegProgressTracker {
    fn track(&mut self, line: &str, reporter: &ProgressReporter) {
        let line = line.trim();

        if self.total_seconds.is_none() {
            if let Some(caps) = duration_regex().captures(line) {
                if let Some(total) = clock_to_seconds(&caps[1], &caps[2], &caps[3]) {
                    if total > 0.0 {
                        self.total_seconds = Some(total / self.speed);
                    }
                }
                return;
            }
        }

        if line == "progress=end" {
            reporter.report(100.0, Some("done"));
            return;
        }

        // out_time_ms è in microsecondi nonostante il nome
        if let Some(value) = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))
        {
            if let Ok(micros) = value.trim().parse::<i64>() {
                self.report_elapsed(micros.max(0) as f64 / 1_000_000.0, reporter);
            }
            return;
        }

        if let Some(value) = line.strip_prefix("out_time=") {
            let parts: Vec<&str> = value.trim().splitn(3, ':').collect();
            if let [h, m, s] = parts.as_slice() {
                if let Some(elapsed) = clock_to_seconds(h, m, s) {
                    self.report_elapsed(elapsed, reporter);
                }
            }
            return;
        }

        if let Some(caps) = clock_regex().captures(line) {
            if let Some(elapsed) = clock_to_seconds(&caps[1], &caps[2], &caps[3]) {
                self.report_elapsed(elapsed, reporter);
            }
        }
    }

    fn finish(&mut self, reporter: &ProgressReporter) {
        reporter.report(100.0, None);
    }
}

fn gs_range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)processing pages\s+(\d+)\s+through\s+(\d+)").expect("valid regex"))
}

fn gs_page_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Page\s+(\d+)\s*$").expect("valid regex"))
}

/// Ghostscript `pdfwrite` page counter
#[derive(Debug, Clone, Default)]
pub struct GhostscriptProgressTracker {
    first_page: u32,
    total_pages: Option<u32>,
}

impl GhostscriptProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for GhostscriptProgressTracker {
    fn track(&mut self, line: &str, reporter: &ProgressReporter) {
        let line = line.trim();

        if let Some(caps) = gs_range_regex().captures(line) {
            let first: u32 = caps[1].parse().unwrap_or(1);
            let last: u32 = caps[2].parse().unwrap_or(first);
            self.first_page = first;
            self.total_pages = Some(last.saturating_sub(first) + 1);
            return;
        }

        if let (Some(caps), Some(total)) = (gs_page_regex().captures(line), self.total_pages) {
            let page: u32 = match caps[1].parse() {
                Ok(page) => page,
                Err(_) => return,
            };
            let done = page.saturating_sub(self.first_page) + 1;
            let percentage = (done as f64 / total as f64 * 100.0).min(PRE_COMPLETION_CAP);
            let message = format!("page {} of {}", done.min(total), total);
            reporter.report(percentage, Some(&message));
        }
    }
}

fn frame_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)frame\s+(\d+)\s*/\s*(\d+)").expect("valid regex"))
}

/// gifski frame counter
#[derive(Debug, Clone, Default)]
pub struct GifskiProgressTracker;

impl GifskiProgressTracker {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressTracker for GifskiProgressTracker {
    fn track(&mut self, line: &str, reporter: &ProgressReporter) {
        if let Some(caps) = frame_regex().captures(line) {
            let (Ok(frame), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) else {
                return;
            };
            if total == 0 {
                return;
            }
            let percentage = frame as f64 / total as f64 * 100.0;
            reporter.report(percentage, None);
        }
    }
}
