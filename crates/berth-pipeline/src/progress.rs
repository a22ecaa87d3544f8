//! Stage progress reporting.
//!
//! A [`ProgressReporter`] hands out a fresh [`ProgressToken`] per in-flight
//! stage, tracks its percent/message/status, and forwards notifications as
//! [`PipelineEvent::Progress`] on the shared [`EventEmitter`]. Updates are
//! throttled per token; the first update, 0%/100% updates and terminal
//! notifications always go out.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventEmitter, PipelineEvent};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// Unique, never-reused handle for one in-flight stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressToken(uuid::Uuid);

impl ProgressToken {
    fn fresh() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

/// Snapshot of one stage's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStage {
    pub token: ProgressToken,
    pub stage: String,
    pub trace_id: String,
    pub status: ProgressStatus,
    pub percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A single notification on the progress feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub token: ProgressToken,
    pub trace_id: String,
    pub stage: String,
    pub message: String,
    pub percent: u8,
    pub status: ProgressStatus,
    pub terminal: bool,
}

struct Entry {
    record: ProgressStage,
    started: Instant,
    last_sent: Option<Instant>,
    finished: Option<Instant>,
}

struct Inner {
    entries: Mutex<HashMap<ProgressToken, Entry>>,
    emitter: EventEmitter,
    min_interval: Duration,
    retention: Duration,
}

/// Tracks in-flight stages and publishes their progress.
///
/// Clones share the same stage table. [`ProgressReporter::with_trace_id`]
/// produces a run-scoped handle whose notifications carry that trace ID.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
    trace_id: Arc<str>,
}

impl ProgressReporter {
    pub fn new(emitter: EventEmitter) -> Self {
        Self::with_limits(emitter, DEFAULT_MIN_INTERVAL, DEFAULT_RETENTION)
    }

    pub fn with_limits(emitter: EventEmitter, min_interval: Duration, retention: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                emitter,
                min_interval,
                retention,
            }),
            trace_id: Arc::from(""),
        }
    }

    /// A handle sharing this reporter's state whose notifications carry `trace_id`.
    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.clone(),
            trace_id: Arc::from(trace_id.into()),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    /// Register a new in-flight stage and announce it at 0%.
    pub fn start_stage(&self, stage: &str) -> ProgressToken {
        let token = ProgressToken::fresh();
        let now = Instant::now();
        let record = ProgressStage {
            token,
            stage: stage.to_string(),
            trace_id: self.trace_id.to_string(),
            status: ProgressStatus::Running,
            percent: 0,
            message: format!("{stage} started"),
            started_at: Utc::now(),
            duration_ms: None,
        };
        let event = event_for(&record);

        {
            let mut entries = self.lock();
            self.prune(&mut entries, now);
            entries.insert(
                token,
                Entry {
                    record,
                    started: now,
                    last_sent: Some(now),
                    finished: None,
                },
            );
        }

        tracing::debug!(stage, %token, trace_id = %self.trace_id, "Stage progress started");
        self.inner.emitter.emit(PipelineEvent::Progress(event));
        token
    }

    /// Record progress for a running stage.
    ///
    /// Unknown and completed tokens are ignored with a debug log. `percent`
    /// is clamped to 100. The notification is forwarded unless an earlier one
    /// for this token went out less than the minimum interval ago.
    pub fn update_progress(&self, token: ProgressToken, message: &str, percent: u32) {
        self.record(token, message, percent, false);
    }

    /// Like [`update_progress`](Self::update_progress), but never throttled.
    /// Used at attempt boundaries so every retry is visible.
    pub fn mark_attempt(&self, token: ProgressToken, message: &str, percent: u32) {
        self.record(token, message, percent, true);
    }

    fn record(&self, token: ProgressToken, message: &str, percent: u32, force: bool) {
        let percent = percent.min(100) as u8;
        let now = Instant::now();

        let event = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&token) else {
                tracing::debug!(%token, "Progress update for unknown token ignored");
                return;
            };
            if entry.record.status.is_terminal() {
                tracing::debug!(%token, stage = %entry.record.stage, "Progress update after completion ignored");
                return;
            }

            entry.record.percent = percent;
            entry.record.message = message.to_string();

            let due = entry
                .last_sent
                .map_or(true, |sent| now.duration_since(sent) >= self.inner.min_interval);
            if !(force || due || percent == 0 || percent == 100) {
                return;
            }
            entry.last_sent = Some(now);
            event_for(&entry.record)
        };

        self.inner.emitter.emit(PipelineEvent::Progress(event));
    }

    /// Mark a stage finished. The entry is kept for the retention window and
    /// then dropped; its token is never handed out again.
    pub fn complete_stage(&self, token: ProgressToken, success: bool, message: &str) {
        let now = Instant::now();

        let event = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&token) else {
                tracing::debug!(%token, "Completion for unknown token ignored");
                return;
            };
            if entry.record.status.is_terminal() {
                tracing::debug!(%token, stage = %entry.record.stage, "Stage already completed");
                return;
            }

            entry.record.status = if success {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            };
            if success {
                entry.record.percent = 100;
            }
            entry.record.message = message.to_string();
            entry.record.duration_ms = Some(now.duration_since(entry.started).as_millis() as u64);
            entry.last_sent = Some(now);
            entry.finished = Some(now);
            event_for(&entry.record)
        };

        self.inner.emitter.emit(PipelineEvent::Progress(event));
    }

    pub fn get(&self, token: ProgressToken) -> Option<ProgressStage> {
        self.lock().get(&token).map(|e| e.record.clone())
    }

    /// Stages still running, oldest first.
    pub fn active(&self) -> Vec<ProgressStage> {
        let mut stages: Vec<ProgressStage> = self
            .lock()
            .values()
            .filter(|e| e.finished.is_none())
            .map(|e| e.record.clone())
            .collect();
        stages.sort_by_key(|s| s.started_at);
        stages
    }

    /// Drop completed entries older than the retention window.
    pub fn collect_garbage(&self) -> usize {
        let mut entries = self.lock();
        self.prune(&mut entries, Instant::now())
    }

    fn prune(&self, entries: &mut HashMap<ProgressToken, Entry>, now: Instant) -> usize {
        let before = entries.len();
        let retention = self.inner.retention;
        entries.retain(|_, e| e.finished.map_or(true, |at| now.duration_since(at) < retention));
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProgressToken, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(EventEmitter::default())
    }
}

fn event_for(record: &ProgressStage) -> ProgressEvent {
    ProgressEvent {
        token: record.token,
        trace_id: record.trace_id.clone(),
        stage: record.stage.clone(),
        message: record.message.clone(),
        percent: record.percent,
        status: record.status,
        terminal: record.status.is_terminal(),
    }
}
