//! Pull-based tail of the backend's append-only log.
//!
//! There is no push channel, so the full log is fetched on a fixed period and only the
//! newest line is looked at. Several lines appended between two polls collapse into one
//! event for the last of them; the ones before it are never seen. This is lossy on
//! purpose: the log is a best-effort signal, not an event bus.

use crate::backend::MaintenanceApi;
use crate::model::{EventCategory, LogEvent, PollCursor};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Evaluated top to bottom; the first pattern found in the line wins.
const CATEGORY_TABLE: &[(&str, EventCategory)] = &[
    ("error", EventCategory::Error),
    ("Error", EventCategory::Error),
    ("ERROR", EventCategory::Error),
    ("Process is currently running", EventCategory::ProcessStarted),
    ("Process stopped successfully", EventCategory::ProcessStopped),
    ("FFMPEG Architecture:", EventCategory::ArchDetected),
    ("Server shutdown initiated", EventCategory::ShutdownInitiated),
    ("Server started", EventCategory::ServerStarted),
    ("No original FFMPEG backup found", EventCategory::BackupMissing),
    ("Original FFMPEG backup found", EventCategory::BackupFound),
    ("Fixing FFMPEG Compatibility", EventCategory::FixStarted),
    ("FFMPEG compatibility fixed successfully", EventCategory::FixCompleted),
    ("Restoring original FFMPEG binaries", EventCategory::RestoreStarted),
    (
        "Original FFMPEG binaries restored successfully",
        EventCategory::RestoreCompleted,
    ),
];

pub fn classify(line: &str) -> EventCategory {
    CATEGORY_TABLE
        .iter()
        .find(|(pattern, _)| line.contains(pattern))
        .map(|(_, category)| *category)
        .unwrap_or(EventCategory::Uncategorized)
}

fn is_date(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

/// Leading timestamp token of a log line.
///
/// Normally the first space-separated token. Lines written as `YYYY-MM-DD HH:MM:SS,mmm ...`
/// carry the date and the time as two tokens; both are taken so lines from the same day
/// stay distinguishable.
pub fn leading_timestamp(line: &str) -> &str {
    let line = line.trim_start();
    let first_end = line.find(' ').unwrap_or(line.len());
    let first = &line[..first_end];
    if is_date(first) {
        let rest = &line[first_end..];
        let trimmed = rest.trim_start_matches(' ');
        let second_len = trimmed.find(' ').unwrap_or(trimmed.len());
        let second = &trimmed[..second_len];
        if second.starts_with(|c: char| c.is_ascii_digit()) && second.contains(':') {
            let end = first_end + (rest.len() - trimmed.len()) + second_len;
            return &line[..end];
        }
    }
    first
}

/// Cursor plus the last fetched text. Pure; the monitor task drives it.
#[derive(Debug, Default, Clone)]
pub struct LogTail {
    cursor: PollCursor,
    last_text: Option<String>,
}

impl LogTail {
    #[cfg(test)]
    pub fn cursor(&self) -> &PollCursor {
        &self.cursor
    }

    pub fn reset(&mut self) {
        *self = LogTail::default();
    }

    /// Feed one fetch; returns the event for the newest line if it has not been seen.
    pub fn ingest(&mut self, text: &str) -> Option<LogEvent> {
        if text.is_empty() || self.last_text.as_deref() == Some(text) {
            return None;
        }
        self.last_text = Some(text.to_string());

        let latest = text.lines().last()?.trim();
        if latest.is_empty() {
            return None;
        }
        let timestamp = leading_timestamp(latest);
        if self.cursor.last_seen_timestamp.as_deref() == Some(timestamp) {
            return None;
        }
        self.cursor.last_seen_timestamp = Some(timestamp.to_string());
        Some(LogEvent {
            timestamp: timestamp.to_string(),
            raw_line: latest.to_string(),
            category: classify(latest),
        })
    }
}

/// Tagged with the epoch of the poller that produced it.
#[derive(Debug, Clone)]
pub enum PollerEvent {
    Line { epoch: u64, event: LogEvent },
    FetchFailed { epoch: u64, reason: String },
}

impl PollerEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            PollerEvent::Line { epoch, .. } | PollerEvent::FetchFailed { epoch, .. } => *epoch,
        }
    }
}

/// Owns the polling task. Start and stop are both idempotent.
pub struct LogMonitor {
    api: Arc<dyn MaintenanceApi>,
    interval: Duration,
    tail: Arc<Mutex<LogTail>>,
    handle: Option<JoinHandle<()>>,
    /// Bumped on every start; events from earlier pollers may still sit in the channel.
    epoch: u64,
}

fn lock(tail: &Mutex<LogTail>) -> MutexGuard<'_, LogTail> {
    // The guarded data stays consistent even if a holder panicked.
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LogMonitor {
    /// A zero interval falls back to [`DEFAULT_POLL_INTERVAL`].
    pub fn new(api: Arc<dyn MaintenanceApi>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        Self {
            api,
            interval,
            tail: Arc::new(Mutex::new(LogTail::default())),
            handle: None,
            epoch: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// False for events queued by a poller that has since been stopped or replaced.
    pub fn is_current(&self, ev: &PollerEvent) -> bool {
        self.is_running() && ev.epoch() == self.epoch
    }

    #[cfg(test)]
    pub fn cursor(&self) -> PollCursor {
        lock(&self.tail).cursor().clone()
    }

    /// Starts polling from a fresh cursor. A running poller is stopped first.
    pub fn start(&mut self, events: UnboundedSender<PollerEvent>) {
        self.stop();
        lock(&self.tail).reset();
        self.epoch += 1;

        let epoch = self.epoch;
        let api = self.api.clone();
        let tail = self.tail.clone();
        let period = self.interval;
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Ticks are serialized: a slow fetch delays the next tick instead of stacking.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fetched = api.fetch_log_tail().await;
                let out = match fetched {
                    Ok(text) => {
                        let ev = lock(&tail).ingest(&text);
                        match ev {
                            Some(event) => {
                                debug!(epoch, timestamp = %event.timestamp, category = ?event.category, "new log line");
                                PollerEvent::Line { epoch, event }
                            }
                            None => continue,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "log poll failed, retrying on next tick");
                        PollerEvent::FetchFailed {
                            epoch,
                            reason: e.to_string(),
                        }
                    }
                };
                if events.send(out).is_err() {
                    break;
                }
            }
        }));
    }

    /// Stops polling. The cursor is left as it was.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
