//! Per-execution activity invocation log: one append-only record
//! per activity attempt, independent of checkpointing -- a checkpoint
//! captures state, the activity log captures *what was called and when*,
//! useful for auditing retries and reconstructing timing after the fact.
//! Same shape as [`crate::checkpoint::Checkpointer`]: a narrow trait plus an
//! in-process reference implementation; a durable on-disk backend (one JSON
//! object per line per execution) is an external collaborator a host
//! application brings itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use wayforge_types::WorkflowError;

/// One activity invocation attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: u64,
    pub execution_id: String,
    pub activity: String,
    pub step_name: String,
    pub path_id: String,
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ActivityLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        activity: impl Into<String>,
        step_name: impl Into<String>,
        path_id: impl Into<String>,
        parameters: HashMap<String, Value>,
        outcome: &Result<Value, WorkflowError>,
        start_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            execution_id: execution_id.into(),
            activity: activity.into(),
            step_name: step_name.into(),
            path_id: path_id.into(),
            parameters,
            result: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            start_time,
            duration_seconds,
        }
    }
}

/// Appends activity invocation records for an execution. Stored as
/// `Arc<dyn ActivityLogger>`, so `append` returns a boxed future rather than
/// a native `async fn`.
pub trait ActivityLogger: Send + Sync {
    fn append(&self, entry: ActivityLogEntry) -> BoxFuture<'_, ()>;
}

/// A logger that discards every entry -- the default when a host registers
/// none of its own.
pub struct NoopActivityLogger;

impl ActivityLogger for NoopActivityLogger {
    fn append(&self, _entry: ActivityLogEntry) -> BoxFuture<'_, ()> {
        Box::pin(async move {})
    }
}

/// An in-memory, per-execution append-only log, guarded by a single mutex
/// so two concurrent attempts on different paths never interleave a
/// half-written record.
#[derive(Default)]
pub struct InMemoryActivityLog {
    entries: Mutex<Vec<ActivityLogEntry>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries for `execution_id`, in append order.
    pub fn entries_for(&self, execution_id: &str) -> Vec<ActivityLogEntry> {
        self.entries
            .lock()
            .expect("activity log lock poisoned")
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

impl ActivityLogger for InMemoryActivityLog {
    fn append(&self, entry: ActivityLogEntry) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.entries.lock().expect("activity log lock poisoned").push(entry);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_a_successful_attempt() {
        let log = InMemoryActivityLog::new();
        let outcome: Result<Value, WorkflowError> = Ok(json!("ok"));
        let entry = ActivityLogEntry::new("exec-1", "print", "step-a", "main", HashMap::new(), &outcome, Utc::now(), 0.01);
        log.append(entry).await;

        let entries = log.entries_for("exec-1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, Some(json!("ok")));
        assert!(entries[0].error.is_none());
    }

    #[tokio::test]
    async fn records_a_failed_attempt() {
        let log = InMemoryActivityLog::new();
        let outcome: Result<Value, WorkflowError> = Err(WorkflowError::activity_failed("boom"));
        let entry = ActivityLogEntry::new("exec-1", "print", "step-a", "main", HashMap::new(), &outcome, Utc::now(), 0.01);
        log.append(entry).await;

        let entries = log.entries_for("exec-1");
        assert!(entries[0].result.is_none());
        assert_eq!(entries[0].error.as_deref(), Some("ACTIVITY_FAILED: boom"));
    }

    #[tokio::test]
    async fn entries_are_scoped_per_execution() {
        let log = InMemoryActivityLog::new();
        let outcome: Result<Value, WorkflowError> = Ok(json!(1));
        log.append(ActivityLogEntry::new("exec-1", "a", "s", "main", HashMap::new(), &outcome, Utc::now(), 0.0))
            .await;
        log.append(ActivityLogEntry::new("exec-2", "a", "s", "main", HashMap::new(), &outcome, Utc::now(), 0.0))
            .await;
        assert_eq!(log.entries_for("exec-1").len(), 1);
        assert_eq!(log.entries_for("exec-2").len(), 1);
    }

    #[tokio::test]
    async fn noop_logger_never_panics() {
        let outcome: Result<Value, WorkflowError> = Ok(json!(1));
        NoopActivityLogger
            .append(ActivityLogEntry::new("exec-1", "a", "s", "main", HashMap::new(), &outcome, Utc::now(), 0.0))
            .await;
    }
}
