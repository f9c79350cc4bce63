//! Download lifecycle observers.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error, info};

use crate::error::ErrorKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Queued,
    Started,
    Progress { bytes: u64, total: Option<u64> },
    Done,
    Failed(ErrorKind),
}

/// Receives events from whichever worker handles a feature, so implementations must
/// tolerate concurrent calls. Calls are synchronous; keep them short.
pub trait StatusMonitor: Send + Sync {
    fn notify(&self, feature_id: &str, event: &Event);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitor;

impl StatusMonitor for NoopMonitor {
    fn notify(&self, _feature_id: &str, _event: &Event) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl fmt::Display for MonitorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} done, {} failed, {} in progress, {} transferred",
            self.done,
            self.failed,
            self.in_progress,
            bytes_to_human(self.bytes)
        )
    }
}

/// Logs lifecycle events and keeps running totals.
#[derive(Debug, Default)]
pub struct LoggingMonitor {
    in_progress: AtomicUsize,
    done: AtomicUsize,
    failed: AtomicUsize,
    bytes: AtomicU64,
    // Last reported byte count per feature, to turn cumulative progress into deltas
    progress: Mutex<HashMap<String, u64>>,
}

impl LoggingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> MonitorSummary {
        MonitorSummary {
            in_progress: self.in_progress.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn finish(&self, feature_id: &str) {
        self.progress.lock().remove(feature_id);
        // Saturate: a feature can fail before it ever started
        let _ = self
            .in_progress
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl StatusMonitor for LoggingMonitor {
    fn notify(&self, feature_id: &str, event: &Event) {
        match event {
            Event::Queued => debug!("{}: queued", feature_id),
            Event::Started => {
                self.in_progress.fetch_add(1, Ordering::Relaxed);
                info!("{}: started", feature_id);
            }
            Event::Progress { bytes, total } => {
                let previous = self
                    .progress
                    .lock()
                    .insert(feature_id.to_string(), *bytes)
                    .unwrap_or(0);
                self.bytes
                    .fetch_add(bytes.saturating_sub(previous), Ordering::Relaxed);
                match total {
                    Some(total) => debug!(
                        "{}: {} of {}",
                        feature_id,
                        bytes_to_human(*bytes),
                        bytes_to_human(*total)
                    ),
                    None => debug!("{}: {}", feature_id, bytes_to_human(*bytes)),
                }
            }
            Event::Done => {
                self.finish(feature_id);
                self.done.fetch_add(1, Ordering::Relaxed);
                info!("{}: done", feature_id);
            }
            Event::Failed(kind) => {
                self.finish(feature_id);
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("{}: failed ({})", feature_id, kind);
            }
        }
    }
}

/// Formats a byte count with decimal units.
pub fn bytes_to_human(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1_000_000_000_000, "TB"),
        (1_000_000_000, "GB"),
        (1_000_000, "MB"),
        (1_000, "KB"),
    ];
    for (scale, unit) in UNITS {
        if bytes >= scale {
            return format!("{:.2} {}", bytes as f64 / scale as f64, unit);
        }
    }
    format!("{} B", bytes)
}
