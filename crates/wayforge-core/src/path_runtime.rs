//! Drives one path through successive steps, turning step results into the
//! four path-runtime outcomes: linear advance, fan-out, join encounter,
//! terminal. Emits a [`PathSnapshot`] after every step onto a
//! shared channel; the orchestrator is the only consumer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use wayforge_types::WorkflowError;
use wayforge_types::workflow::{JoinConfig, Workflow};

use crate::activity::ActivityRegistry;
use crate::activity_log::ActivityLogger;
use crate::callbacks::Callbacks;
use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::path::Path;
use crate::step_executor::{self, StepOutcome};
use crate::templating::Compiler;

/// A pending child path, carried on a `Completed`/`Running` snapshot that
/// fans out.
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub target_step: String,
    pub variables: HashMap<String, Value>,
    pub label: Option<String>,
}

/// Delivered to a parked path when the orchestrator resolves the join it's
/// waiting on.
pub struct ResumeSignal {
    pub current_step: String,
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Running,
    Completed,
    Failed,
    Waiting,
}

/// Carried on a `Waiting` snapshot describing the join point a path has
/// parked at.
pub struct JoinRequest {
    pub step_name: String,
    pub config: JoinConfig,
}

/// One path task's report of a single step's outcome, consumed by the
/// orchestrator's main loop.
pub struct PathSnapshot {
    pub path_id: String,
    pub step_name: String,
    pub status: SnapshotStatus,
    pub step_output: Option<Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<WorkflowError>,
    pub new_paths: Vec<PathSpec>,
    pub join_request: Option<JoinRequest>,
    pub variables: Option<HashMap<String, Value>>,
    /// Present only on a `Waiting` snapshot: the single-slot channel the
    /// orchestrator pulses to resume this path.
    pub resume_tx: Option<oneshot::Sender<ResumeSignal>>,
}

impl PathSnapshot {
    fn base(path_id: String, step_name: String, start_time: DateTime<Utc>) -> Self {
        Self {
            path_id,
            step_name,
            status: SnapshotStatus::Running,
            step_output: None,
            start_time,
            end_time: None,
            error: None,
            new_paths: Vec::new(),
            join_request: None,
            variables: None,
            resume_tx: None,
        }
    }
}

/// Drive `path` through steps until it terminates, fans out, parks on a
/// join, or the execution is cancelled. Consumes `path`; it never outlives
/// this task.
#[allow(clippy::too_many_arguments)]
pub async fn run_path(
    mut path: Path,
    workflow: Arc<Workflow>,
    registry: Arc<ActivityRegistry>,
    compiler: Arc<dyn Compiler>,
    config: Arc<EngineConfig>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    snapshots: mpsc::Sender<PathSnapshot>,
    execution_id: Arc<str>,
    logger: Arc<dyn ActivityLogger>,
    callbacks: Arc<dyn Callbacks>,
) {
    let span = tracing::debug_span!("path", path_id = %path.id);
    let _enter = span.enter();
    callbacks.before_path(&execution_id, &path.id);

    loop {
        if cancellation.is_cancelled() {
            tracing::debug!(step = %path.current_step, "path observed cancellation, stopping");
            return;
        }

        let step_name = path.current_step.clone();
        let Some(step) = workflow.step(&step_name) else {
            let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), Utc::now());
            snapshot.status = SnapshotStatus::Failed;
            snapshot.end_time = Some(Utc::now());
            snapshot.error = Some(WorkflowError::fatal(format!("unknown step '{step_name}'")));
            let _ = snapshots.send(snapshot).await;
            return;
        };

        let start_time = Utc::now();
        tracing::debug!(step = %step_name, "entering step");

        if let Some(join_config) = &step.join {
            let (resume_tx, resume_rx) = oneshot::channel();
            let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
            snapshot.status = SnapshotStatus::Waiting;
            snapshot.variables = Some(path.variables_snapshot());
            snapshot.join_request = Some(JoinRequest {
                step_name: step_name.clone(),
                config: join_config.clone(),
            });
            snapshot.resume_tx = Some(resume_tx);
            if snapshots.send(snapshot).await.is_err() {
                return;
            }

            tracing::debug!(step = %step_name, "parked waiting for join");
            match resume_rx.await {
                Ok(signal) => {
                    for (k, v) in signal.variables {
                        path.set_variable(k, v);
                    }
                    path.current_step = signal.current_step;
                    continue;
                }
                Err(_) => {
                    tracing::debug!(step = %step_name, "resume channel dropped, path ending");
                    return;
                }
            }
        }

        let run = step_executor::execute_step(
            step,
            &path,
            &registry,
            &compiler,
            &config,
            &cancellation,
            deadline,
            &execution_id,
            &logger,
            &callbacks,
        )
        .await;

        let end_time = Utc::now();
        let run = match run {
            Ok(run) => run,
            Err(err) => {
                // A template/condition-evaluation failure (e.g. a missing
                // variable) is an `ACTIVITY_FAILED` classification per the
                // templating spec, not a path-fatal error -- only a genuine
                // resolution problem (unknown activity, unknown step) is
                // fatal here.
                let error = match &err {
                    ExecutionError::Template(_) => WorkflowError::activity_failed(err.to_string()),
                    _ => WorkflowError::fatal(err.to_string()),
                };
                let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                snapshot.status = SnapshotStatus::Failed;
                snapshot.end_time = Some(end_time);
                snapshot.error = Some(error);
                let _ = snapshots.send(snapshot).await;
                return;
            }
        };

        match run.outcome {
            StepOutcome::Failed(error) => {
                let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                snapshot.status = SnapshotStatus::Failed;
                snapshot.step_output = run.step_output;
                snapshot.end_time = Some(end_time);
                snapshot.variables = Some(path.variables_snapshot());
                snapshot.error = Some(error);
                let _ = snapshots.send(snapshot).await;
                return;
            }
            StepOutcome::CaughtRedirect(next) => {
                let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                snapshot.step_output = run.step_output;
                snapshot.end_time = Some(end_time);
                snapshot.variables = Some(path.variables_snapshot());
                if snapshots.send(snapshot).await.is_err() {
                    return;
                }
                path.current_step = next;
                continue;
            }
            StepOutcome::Edges(edges) => {
                let current_label = path.id.as_str();
                let is_linear = edges.len() == 1
                    && (edges[0].path.is_none() || edges[0].path.as_deref() == Some(current_label));

                if edges.is_empty() {
                    let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                    snapshot.status = SnapshotStatus::Completed;
                    snapshot.step_output = run.step_output;
                    snapshot.end_time = Some(end_time);
                    snapshot.variables = Some(path.variables_snapshot());
                    let _ = snapshots.send(snapshot).await;
                    return;
                }

                if is_linear {
                    let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                    snapshot.step_output = run.step_output;
                    snapshot.end_time = Some(end_time);
                    snapshot.variables = Some(path.variables_snapshot());
                    if snapshots.send(snapshot).await.is_err() {
                        return;
                    }
                    path.current_step = edges[0].target.clone();
                    continue;
                }

                let variables = path.variables_snapshot();
                let new_paths = edges
                    .iter()
                    .map(|edge| PathSpec {
                        target_step: edge.target.clone(),
                        variables: variables.clone(),
                        label: edge.path.clone(),
                    })
                    .collect();

                let mut snapshot = PathSnapshot::base(path.id.clone(), step_name.clone(), start_time);
                snapshot.status = SnapshotStatus::Completed;
                snapshot.step_output = run.step_output;
                snapshot.end_time = Some(end_time);
                snapshot.variables = Some(variables);
                snapshot.new_paths = new_paths;
                let _ = snapshots.send(snapshot).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wayforge_types::workflow::Edge;
    use wayforge_types::workflow::Step;

    use crate::activity_log::{ActivityLogger, NoopActivityLogger};
    use crate::templating::JexlCompiler;

    fn workflow(steps: Vec<Step>) -> Arc<Workflow> {
        Arc::new(Workflow::new("wf", steps, vec![], vec![], HashMap::new()).unwrap())
    }

    fn no_logging() -> (Arc<str>, Arc<dyn ActivityLogger>) {
        (Arc::from("exec-1"), Arc::new(NoopActivityLogger))
    }

    fn no_callbacks() -> Arc<dyn crate::callbacks::Callbacks> {
        Arc::new(crate::callbacks::NoopCallbacks)
    }

    #[tokio::test]
    async fn terminal_step_emits_a_completed_snapshot_with_no_new_paths() {
        let wf = workflow(vec![Step::new("only")]);
        let registry = Arc::new(ActivityRegistry::new());
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = Arc::new(EngineConfig::default());
        let cancellation = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (execution_id, logger) = no_logging();

        let path = Path::new("main", "only", HashMap::new(), Arc::new(json!({})));
        run_path(
            path, wf, registry, compiler, config, cancellation, None, tx, execution_id, logger, no_callbacks(),
        )
        .await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Completed);
        assert!(snapshot.new_paths.is_empty());
    }

    #[tokio::test]
    async fn single_unlabelled_edge_is_a_linear_advance_then_terminal() {
        let mut a = Step::new("a");
        a.edges.push(Edge::to("b"));
        let wf = workflow(vec![a, Step::new("b")]);
        let registry = Arc::new(ActivityRegistry::new());
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = Arc::new(EngineConfig::default());
        let cancellation = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (execution_id, logger) = no_logging();

        let path = Path::new("main", "a", HashMap::new(), Arc::new(json!({})));
        run_path(
            path, wf, registry, compiler, config, cancellation, None, tx, execution_id, logger, no_callbacks(),
        )
        .await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, SnapshotStatus::Running);
        assert_eq!(first.step_name, "a");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, SnapshotStatus::Completed);
        assert_eq!(second.step_name, "b");
    }

    #[tokio::test]
    async fn two_matching_edges_fan_out_into_child_path_specs() {
        let mut start = Step::new("start");
        start.edges.push(Edge::to("x").labelled("a"));
        start.edges.push(Edge::to("y").labelled("b"));
        let wf = workflow(vec![start, Step::new("x"), Step::new("y")]);
        let registry = Arc::new(ActivityRegistry::new());
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = Arc::new(EngineConfig::default());
        let cancellation = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (execution_id, logger) = no_logging();

        let path = Path::new("main", "start", HashMap::new(), Arc::new(json!({})));
        run_path(
            path, wf, registry, compiler, config, cancellation, None, tx, execution_id, logger, no_callbacks(),
        )
        .await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Completed);
        assert_eq!(snapshot.new_paths.len(), 2);
    }

    #[tokio::test]
    async fn join_step_parks_and_reports_a_waiting_snapshot() {
        let mut join_step = Step::new("join");
        join_step.join = Some(JoinConfig::default());
        let wf = workflow(vec![join_step]);
        let registry = Arc::new(ActivityRegistry::new());
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = Arc::new(EngineConfig::default());
        let cancellation = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (execution_id, logger) = no_logging();

        let path = Path::new("main", "join", HashMap::new(), Arc::new(json!({})));
        let handle = tokio::spawn(run_path(
            path, wf, registry, compiler, config, cancellation, None, tx, execution_id, logger, no_callbacks(),
        ));

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Waiting);
        assert!(snapshot.resume_tx.is_some());
        drop(snapshot.resume_tx);
        handle.await.unwrap();
    }
}
