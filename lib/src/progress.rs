//! Typed pipeline events and the sinks that receive them.
//!
//! Components never log directly about per-item progress; they emit a
//! [`PipelineEvent`] through the [`EventSink`] they were constructed with.
//! [`LogSink`] forwards events to the `log` facade and [`CollectingSink`]
//! keeps them in memory so tests can assert on them.

use log::{error, info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A single attempt failed and will be retried.
    Warning { message: String },
    /// A page of identifiers was collected from the endpoint.
    PageCollected { count: u64, page_size: u64, offset: u64 },
    /// A page could not be collected after all retries; discovery continues.
    PageFailed { offset: u64, page_size: u64, message: String },
    /// A discovered identifier could not be pushed onto the queue.
    PushFailed { iri: String, message: String },
    /// A resource was stored; `processed` counts successes in this batch so far.
    ResourceStored { total: usize, processed: usize },
    /// Storing a resource failed; the item was put back with a higher retry count.
    ItemRetried { iri: String, retry_count: u32, message: String },
    /// An item exceeded its retry budget and was removed from the queue.
    ItemDropped { iri: String, message: String },
}

/// Receives events from pipeline components. Implementations must tolerate
/// concurrent calls from worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Logs events through the `log` facade, rate limiting progress to one line
/// per percentage point.
pub struct LogSink {
    progress: Mutex<ProgressLogger>,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(ProgressLogger::new(Instant::now())),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Warning { message } => warn!("{message}"),
            PipelineEvent::PageCollected {
                count,
                page_size: _,
                offset,
            } => info!(
                "Collected {} IRIs from offset {} to {}",
                count,
                offset,
                offset + count
            ),
            PipelineEvent::PageFailed {
                offset,
                page_size,
                message,
            } => error!(
                "Error while collecting {} IRIs from offset {}: {}",
                page_size, offset, message
            ),
            PipelineEvent::PushFailed { iri, message } => error!(
                "An error occurred when pushing IRI \"{}\" to queue: {}",
                iri, message
            ),
            PipelineEvent::ResourceStored { total, processed } => {
                if let Ok(mut progress) = self.progress.lock() {
                    if let Some(line) = progress.update(total, processed) {
                        info!("{line}");
                    }
                }
            }
            PipelineEvent::ItemRetried {
                iri,
                retry_count,
                message,
            } => error!(
                "An error occurred when saving \"{}\" (retry {}): {}",
                iri, retry_count, message
            ),
            PipelineEvent::ItemDropped { iri, message } => {
                error!("Dropped \"{}\" from the queue: {}", iri, message)
            }
        }
    }
}

/// Keeps every event; used by tests and by callers that want a run summary.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Turns `(total, processed)` pairs into log lines, emitting each rounded
/// percentage only once.
#[derive(Debug)]
pub struct ProgressLogger {
    start: Instant,
    prev_percentage: Option<u64>,
}

impl ProgressLogger {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            prev_percentage: None,
        }
    }

    pub fn update(&mut self, total: usize, processed: usize) -> Option<String> {
        if total == 0 {
            return None;
        }
        let percentage = ((processed as f64 / total as f64) * 100.0).round() as u64;
        if self.prev_percentage == Some(percentage) {
            return None;
        }
        self.prev_percentage = Some(percentage);
        Some(format!(
            "Stored {}% of {} resources (runtime: {})",
            percentage,
            total,
            pretty_duration(self.start.elapsed())
        ))
    }
}

/// Lets `GRAPHMIRROR_LOG` override `RUST_LOG` before a logger is installed.
pub fn init_logging() {
    if let Ok(log_level) = std::env::var(crate::consts::LOG_ENV_VAR) {
        std::env::set_var("RUST_LOG", log_level);
    }
}

/// Formats a duration the way run summaries print it, e.g. `1m 3.2s` or `850ms`.
pub fn pretty_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        return format!("{millis}ms");
    }
    let total_secs = duration.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = (total_secs % 60) as f64 + f64::from(duration.subsec_millis()) / 1_000.0;
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds:.1}s"));
    parts.join(" ")
}
