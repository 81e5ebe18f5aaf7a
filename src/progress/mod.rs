//! Progress reporter: append-only run log with derived metrics.
//!
//! Each generation or dispatch run gets a fresh [`ProgressLog`]. Events are
//! never mutated or removed while the run is active; observers either read a
//! snapshot or subscribe to the live broadcast.

pub mod ws;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::recipients::RecipientId;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 512;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Success,
    Error,
    Processing,
}

impl EventKind {
    /// Whether this kind records a recipient outcome.
    pub fn is_outcome(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// A single entry in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<RecipientId>,
}

/// What a run log is narrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Generation,
    Dispatch,
}

/// The log of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressLog {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    /// Recipients the run expects to report on.
    pub total: usize,
    pub events: Vec<ProgressEvent>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProgressLog {
    fn new(kind: RunKind, total: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind,
            started_at,
            total,
            events: Vec::new(),
            finished_at: None,
        }
    }

    /// Derive metrics as of `now`.
    pub fn metrics(&self, now: DateTime<Utc>) -> ProgressMetrics {
        // One outcome per recipient; a later event supersedes an earlier one.
        let mut outcomes: HashMap<&RecipientId, EventKind> = HashMap::new();
        for event in &self.events {
            if let (Some(id), true) = (&event.recipient_id, event.kind.is_outcome()) {
                outcomes.insert(id, event.kind);
            }
        }
        let succeeded = outcomes
            .values()
            .filter(|k| **k == EventKind::Success)
            .count();
        let failed = outcomes.len() - succeeded;

        let end = self.finished_at.unwrap_or(now);
        let elapsed = elapsed_between(self.started_at, end);
        let completed = outcomes.len();
        let fraction = completed_fraction(completed, self.total);

        ProgressMetrics {
            elapsed,
            completed,
            total: self.total,
            succeeded,
            failed,
            completed_fraction: fraction,
            eta: if self.finished_at.is_some() {
                Some(Duration::ZERO)
            } else {
                eta(elapsed, fraction)
            },
            finished: self.finished_at.is_some(),
        }
    }
}

/// Metrics derived from a log; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub elapsed: Duration,
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub completed_fraction: f64,
    /// `None` until at least one recipient has completed.
    pub eta: Option<Duration>,
    pub finished: bool,
}

impl ProgressMetrics {
    /// "N of M succeeded".
    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.succeeded, self.total)
    }
}

/// Wall-clock time between two instants, zero if `end` precedes `start`.
pub fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    end.signed_duration_since(start)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Fraction of `total` that has completed, clamped to `[0, 1]`.
pub fn completed_fraction(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64).min(1.0)
}

/// `elapsed / fraction * (1 - fraction)`, undefined while nothing completed.
pub fn eta(elapsed: Duration, fraction: f64) -> Option<Duration> {
    if fraction <= 0.0 || !fraction.is_finite() {
        return None;
    }
    let remaining = elapsed.as_secs_f64() / fraction * (1.0 - fraction);
    Some(Duration::from_secs_f64(remaining.max(0.0)))
}

/// Messages broadcast to live observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// A new run (and a new log) started.
    RunStarted {
        run_id: Uuid,
        kind: RunKind,
        total: usize,
        started_at: DateTime<Utc>,
    },
    /// An event was appended.
    Event { run_id: Uuid, event: ProgressEvent },
    /// The run finished.
    RunFinished {
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        summary: String,
    },
}

impl ProgressMessage {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::Event { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}

/// Owns the current run log and fans events out to observers.
pub struct ProgressReporter {
    log: RwLock<Option<ProgressLog>>,
    tx: broadcast::Sender<ProgressMessage>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            log: RwLock::new(None),
            tx,
        }
    }

    /// Subscribe to live progress messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.tx.subscribe()
    }

    /// Start a new run, discarding the previous log. Returns the run id.
    pub async fn start_run(&self, kind: RunKind, total: usize) -> Uuid {
        let log = ProgressLog::new(kind, total, Utc::now());
        let run_id = log.run_id;
        let started_at = log.started_at;
        let mut guard = self.log.write().await;
        *guard = Some(log);

        info!(run_id = %run_id, ?kind, total, "Run started");
        // Broadcast under the lock so `observe` never sees a message twice.
        let _ = self.tx.send(ProgressMessage::RunStarted {
            run_id,
            kind,
            total,
            started_at,
        });
        run_id
    }

    /// Append an event to the current run.
    pub async fn emit(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        recipient_id: Option<RecipientId>,
    ) {
        let message = message.into();
        let mut guard = self.log.write().await;
        let Some(log) = guard.as_mut() else {
            warn!(message = %message, "Progress event emitted with no active run");
            return;
        };

        // Keep the log strictly ordered even if the wall clock steps back.
        let mut timestamp = Utc::now();
        if let Some(last) = log.events.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }

        let event = ProgressEvent {
            timestamp,
            kind,
            message,
            recipient_id,
        };
        debug!(kind = ?event.kind, message = %event.message, "Progress event");
        log.events.push(event.clone());
        let run_id = log.run_id;
        let _ = self.tx.send(ProgressMessage::Event { run_id, event });
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.emit(EventKind::Info, message, None).await;
    }

    pub async fn processing(&self, message: impl Into<String>) {
        self.emit(EventKind::Processing, message, None).await;
    }

    pub async fn success(&self, recipient_id: &RecipientId, message: impl Into<String>) {
        self.emit(EventKind::Success, message, Some(recipient_id.clone()))
            .await;
    }

    pub async fn error(&self, recipient_id: Option<&RecipientId>, message: impl Into<String>) {
        self.emit(EventKind::Error, message, recipient_id.cloned())
            .await;
    }

    /// Mark the current run finished and broadcast its summary.
    pub async fn finish_run(&self) -> Option<ProgressMetrics> {
        let mut guard = self.log.write().await;
        let log = guard.as_mut()?;
        if log.finished_at.is_none() {
            log.finished_at = Some(Utc::now());
        }
        let metrics = log.metrics(Utc::now());
        let run_id = log.run_id;
        let finished_at = log.finished_at.unwrap_or_else(Utc::now);

        let summary = metrics.summary();
        info!(run_id = %run_id, summary = %summary, "Run finished");
        let _ = self.tx.send(ProgressMessage::RunFinished {
            run_id,
            finished_at,
            summary,
        });
        drop(guard);
        Some(metrics)
    }

    /// Copy of the current log together with a receiver for everything
    /// emitted after it. No message is in both.
    pub async fn observe(&self) -> (Option<ProgressLog>, broadcast::Receiver<ProgressMessage>) {
        let guard = self.log.read().await;
        let rx = self.tx.subscribe();
        (guard.clone(), rx)
    }

    /// Copy of the current log.
    pub async fn snapshot(&self) -> Option<ProgressLog> {
        self.log.read().await.clone()
    }

    /// Metrics of the current run as of now.
    pub async fn metrics(&self) -> Option<ProgressMetrics> {
        self.log
            .read()
            .await
            .as_ref()
            .map(|log| log.metrics(Utc::now()))
    }
}
