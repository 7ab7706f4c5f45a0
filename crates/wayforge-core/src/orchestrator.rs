//! The execution-wide scheduler: consumes path
//! snapshots off a shared channel, advances `ExecutionState`, spawns
//! fanned-out children, and resolves joins once every contributing path
//! has reported in.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use wayforge_types::dotpath;
use wayforge_types::state::{ExecutionState, ExecutionStatus, JoinState, PathState, PathStatus};
use wayforge_types::workflow::{JoinConfig, Workflow};

use crate::activity::ActivityRegistry;
use crate::activity_log::ActivityLogger;
use crate::callbacks::Callbacks;
use crate::checkpoint::Checkpointer;
use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::path::Path;
use crate::path_runtime::{self, PathSnapshot, ResumeSignal, SnapshotStatus};
use crate::step_executor;
use crate::templating::Compiler;

pub(crate) struct RunLoop {
    workflow: Arc<Workflow>,
    registry: Arc<ActivityRegistry>,
    compiler: Arc<dyn Compiler>,
    config: Arc<EngineConfig>,
    checkpointer: Arc<dyn Checkpointer>,
    callbacks: Arc<dyn Callbacks>,
    activity_logger: Arc<dyn ActivityLogger>,
    state: Arc<RwLock<ExecutionState>>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    inputs: Arc<Value>,
    execution_id: Arc<str>,
    checkpoint_id: u64,
    snapshot_tx: mpsc::Sender<PathSnapshot>,
    resume_senders: HashMap<String, oneshot::Sender<ResumeSignal>>,
    tasks: tokio::task::JoinSet<()>,
}

impl RunLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow: Arc<Workflow>,
        registry: Arc<ActivityRegistry>,
        compiler: Arc<dyn Compiler>,
        config: Arc<EngineConfig>,
        checkpointer: Arc<dyn Checkpointer>,
        callbacks: Arc<dyn Callbacks>,
        activity_logger: Arc<dyn ActivityLogger>,
        state: Arc<RwLock<ExecutionState>>,
        cancellation: CancellationToken,
        deadline: Option<Instant>,
        inputs: Arc<Value>,
        execution_id: String,
        starting_checkpoint_id: u64,
    ) -> Self {
        let (snapshot_tx, _rx) = mpsc::channel(config.snapshot_channel_capacity);
        Self {
            workflow,
            registry,
            compiler,
            config,
            checkpointer,
            callbacks,
            activity_logger,
            state,
            cancellation,
            deadline,
            inputs,
            execution_id: Arc::from(execution_id),
            checkpoint_id: starting_checkpoint_id,
            snapshot_tx,
            resume_senders: HashMap::new(),
            tasks: tokio::task::JoinSet::new(),
        }
    }

    fn spawn_path(&mut self, path: Path) {
        let workflow = self.workflow.clone();
        let registry = self.registry.clone();
        let compiler = self.compiler.clone();
        let config = self.config.clone();
        let cancellation = self.cancellation.clone();
        let deadline = self.deadline;
        let tx = self.snapshot_tx.clone();
        let execution_id = self.execution_id.clone();
        let logger = self.activity_logger.clone();
        let callbacks = self.callbacks.clone();
        self.tasks.spawn(async move {
            path_runtime::run_path(
                path, workflow, registry, compiler, config, cancellation, deadline, tx, execution_id, logger, callbacks,
            )
            .await;
        });
    }

    fn generate_path_id(&mut self, parent: &str, label: Option<&str>) -> Result<String, ExecutionError> {
        match label {
            Some(label) if !label.is_empty() => {
                let mut guard = self.state.write().expect("execution state lock poisoned");
                if guard.path_states.contains_key(label) {
                    return Err(ExecutionError::DuplicatePathLabel(label.to_string()));
                }
                Ok(label.to_string())
            }
            _ => {
                let mut guard = self.state.write().expect("execution state lock poisoned");
                guard.path_counter += 1;
                Ok(format!("{parent}-{}", guard.path_counter))
            }
        }
    }

    fn spawn_child(&mut self, parent: &str, target_step: String, variables: HashMap<String, Value>, label: Option<&str>) -> Result<(), ExecutionError> {
        let new_id = self.generate_path_id(parent, label)?;
        {
            let mut guard = self.state.write().expect("execution state lock poisoned");
            let mut ps = PathState::new(new_id.clone(), target_step.clone());
            ps.variables = variables.clone();
            guard.path_states.insert(new_id.clone(), ps);
        }
        tracing::info!(path_id = %new_id, parent, "path spawned");
        let child = Path::new(new_id, target_step, variables, self.inputs.clone());
        self.spawn_path(child);
        Ok(())
    }

    fn is_join_ready(&self, step_name: &str) -> bool {
        let guard = self.state.read().expect("execution state lock poisoned");
        let Some(join_state) = guard.join_states.get(step_name) else {
            return false;
        };
        let waiting = join_state.waiting_path_id.as_str();
        let contributing_completed = |pid: &str| {
            guard
                .path_states
                .get(pid)
                .map(|ps| ps.status == PathStatus::Completed)
                .unwrap_or(false)
        };

        match &join_state.config.paths {
            Some(paths) => paths.iter().filter(|p| p.as_str() != waiting).all(|p| contributing_completed(p)),
            None => {
                let completed = guard
                    .path_states
                    .values()
                    .filter(|ps| ps.id != waiting && ps.status == PathStatus::Completed)
                    .count();
                let required = join_state.config.count.filter(|c| *c > 0).unwrap_or(2);
                completed >= required
            }
        }
    }

    /// Build the merged variables map for a ready join:
    /// explicit `path_mappings` first, then every unmapped contributing path
    /// written under its own id.
    fn merge_join_variables(&self, contributing: &[String], config: &JoinConfig) -> HashMap<String, Value> {
        let guard = self.state.read().expect("execution state lock poisoned");
        let mut merged = Value::Object(serde_json::Map::new());
        let mut explicitly_mapped: HashSet<&str> = HashSet::new();

        for (key, dest) in &config.path_mappings {
            let (pid, var) = match key.split_once('.') {
                Some((p, v)) => (p, Some(v)),
                None => (key.as_str(), None),
            };
            if !contributing.iter().any(|c| c == pid) {
                continue;
            }
            let Some(ps) = guard.path_states.get(pid) else {
                continue;
            };
            explicitly_mapped.insert(pid);
            let root = Value::Object(ps.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
            let value = match var {
                None => root,
                Some(var_name) => match dotpath::get(&root, var_name) {
                    Some(v) => v.clone(),
                    None => continue,
                },
            };
            dotpath::set(&mut merged, dest, value);
        }

        for pid in contributing {
            if explicitly_mapped.contains(pid.as_str()) {
                continue;
            }
            if let Some(ps) = guard.path_states.get(pid) {
                let root = Value::Object(ps.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
                dotpath::set(&mut merged, pid, root);
            }
        }

        match merged {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    async fn resolve_join(&mut self, step_name: &str) -> Result<(), ExecutionError> {
        let (waiting_id, config) = {
            let guard = self.state.read().expect("execution state lock poisoned");
            let Some(join_state) = guard.join_states.get(step_name) else {
                return Ok(());
            };
            (join_state.waiting_path_id.clone(), join_state.config.clone())
        };

        // An explicit `paths` list names every contributing path, including
        // the waiting path itself if it's listed -- its variables were
        // already captured when it parked, so it's still a valid merge
        // source even though its status is `Waiting`, not `Completed`. The
        // default (no explicit list) scans for completed siblings only,
        // which by construction excludes the waiting path (it isn't
        // completed).
        let contributing: Vec<String> = {
            let guard = self.state.read().expect("execution state lock poisoned");
            match &config.paths {
                Some(paths) => paths.clone(),
                None => guard
                    .path_states
                    .values()
                    .filter(|ps| ps.id != waiting_id && ps.status == PathStatus::Completed)
                    .map(|ps| ps.id.clone())
                    .collect(),
            }
        };

        let merged = self.merge_join_variables(&contributing, &config);

        let step = self
            .workflow
            .step(step_name)
            .ok_or_else(|| ExecutionError::UnknownStep(step_name.to_string()))?;
        let globals = serde_json::json!({"inputs": self.inputs.as_ref(), "state": &merged});
        let matched = step_executor::evaluate_edges(step, &globals, self.compiler.as_ref())?;

        {
            let mut guard = self.state.write().expect("execution state lock poisoned");
            guard.join_states.remove(step_name);
        }

        if matched.len() == 1 && matched[0].path.is_none() {
            let target = matched[0].target.clone();
            {
                let mut guard = self.state.write().expect("execution state lock poisoned");
                if let Some(ps) = guard.path_states.get_mut(&waiting_id) {
                    ps.variables = merged.clone();
                    ps.current_step = target.clone();
                    ps.status = PathStatus::Running;
                }
            }
            tracing::info!(step = step_name, target = %target, waiting = %waiting_id, "join resolved, continuing on the waiting path");
            if let Some(tx) = self.resume_senders.remove(&waiting_id) {
                let _ = tx.send(ResumeSignal {
                    current_step: target,
                    variables: merged,
                });
            }
        } else if matched.is_empty() {
            tracing::info!(step = step_name, waiting = %waiting_id, "join resolved with no matching edges, path completed");
            let mut guard = self.state.write().expect("execution state lock poisoned");
            if let Some(ps) = guard.path_states.get_mut(&waiting_id) {
                ps.status = PathStatus::Completed;
                ps.variables = merged;
                ps.end_time = Some(Utc::now());
            }
            self.resume_senders.remove(&waiting_id);
        } else {
            {
                let mut guard = self.state.write().expect("execution state lock poisoned");
                if let Some(ps) = guard.path_states.get_mut(&waiting_id) {
                    ps.status = PathStatus::Completed;
                    ps.variables = merged.clone();
                    ps.end_time = Some(Utc::now());
                }
            }
            self.resume_senders.remove(&waiting_id);
            tracing::info!(step = step_name, waiting = %waiting_id, matches = matched.len(), "join resolved, fanning out");
            for edge in &matched {
                self.spawn_child(&waiting_id, edge.target.clone(), merged.clone(), edge.path.as_deref())?;
            }
        }

        self.checkpoint().await;
        Ok(())
    }

    /// Re-checks every pending join against the current `ExecutionState`.
    /// Called reactively after every snapshot, and once up front on resume
    /// to catch a join that became ready while the execution was offline.
    pub(crate) async fn resolve_ready_joins(&mut self) -> Result<(), ExecutionError> {
        let ready: Vec<String> = {
            let guard = self.state.read().expect("execution state lock poisoned");
            guard.join_states.keys().cloned().collect()
        };
        for step_name in ready {
            if self.is_join_ready(&step_name) {
                tracing::info!(step = %step_name, "join ready");
                self.resolve_join(&step_name).await?;
            }
        }
        Ok(())
    }

    async fn checkpoint(&mut self) {
        self.checkpoint_id += 1;
        let snapshot = {
            let guard = self.state.read().expect("execution state lock poisoned");
            guard.clone()
        };
        let checkpoint = wayforge_types::state::Checkpoint::from_state(&snapshot, self.checkpoint_id);
        if let Err(e) = self.checkpointer.save(checkpoint).await {
            tracing::warn!(error = %e, "checkpoint save failed, primary execution result is unaffected");
        } else {
            tracing::debug!(checkpoint_id = self.checkpoint_id, "checkpoint saved");
        }
    }

    async fn handle_snapshot(&mut self, snapshot: PathSnapshot) -> Result<(), ExecutionError> {
        match snapshot.status {
            SnapshotStatus::Failed => {
                let error = snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| wayforge_types::WorkflowError::fatal("path failed"));
                tracing::error!(path_id = %snapshot.path_id, step = %snapshot.step_name, error = %error, "path failed");
                {
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    let entry = guard
                        .path_states
                        .entry(snapshot.path_id.clone())
                        .or_insert_with(|| PathState::new(snapshot.path_id.clone(), snapshot.step_name.clone()));
                    entry.status = PathStatus::Failed;
                    entry.current_step = snapshot.step_name.clone();
                    entry.error = Some(error.to_string());
                    entry.end_time = snapshot.end_time;
                    if let Some(vars) = &snapshot.variables {
                        entry.variables = vars.clone();
                    }
                    if let Some(out) = &snapshot.step_output {
                        entry.step_outputs.insert(snapshot.step_name.clone(), out.clone());
                    }
                    guard.error = Some(format!("path '{}' failed: {error}", snapshot.path_id));
                }
                self.callbacks.on_failure(&self.execution_id, &snapshot.path_id, &snapshot.step_name, &error);
                self.cancellation.cancel();
                self.checkpoint().await;
            }
            SnapshotStatus::Waiting => {
                let join_request = snapshot.join_request.expect("waiting snapshot always carries a join_request");

                // A workflow routinely routes more than one fanned-out
                // sibling to the same join-decorated step. Only the first
                // arrival actually parks; per §3's invariant, a JoinState
                // has exactly one waiting path. A later arrival at the same
                // join instead contributes its variables as a completed
                // path and lets its resume channel drop, so `run_path` on
                // that side simply ends rather than parking forever with no
                // one left to wake it.
                let already_waiting = {
                    let guard = self.state.read().expect("execution state lock poisoned");
                    guard
                        .join_states
                        .get(&join_request.step_name)
                        .map(|js| js.waiting_path_id != snapshot.path_id)
                        .unwrap_or(false)
                };

                if already_waiting {
                    tracing::debug!(
                        step = %join_request.step_name,
                        path_id = %snapshot.path_id,
                        "second arrival at an already-parked join, completing instead of waiting"
                    );
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    let entry = guard
                        .path_states
                        .entry(snapshot.path_id.clone())
                        .or_insert_with(|| PathState::new(snapshot.path_id.clone(), snapshot.step_name.clone()));
                    entry.status = PathStatus::Completed;
                    entry.current_step = snapshot.step_name.clone();
                    entry.end_time = Some(Utc::now());
                    if let Some(vars) = &snapshot.variables {
                        entry.variables = vars.clone();
                    }
                    drop(guard);
                    // `snapshot.resume_tx` drops here, closing the channel;
                    // the parked path observes `Err` and ends.
                } else {
                    {
                        let mut guard = self.state.write().expect("execution state lock poisoned");
                        let entry = guard
                            .path_states
                            .entry(snapshot.path_id.clone())
                            .or_insert_with(|| PathState::new(snapshot.path_id.clone(), snapshot.step_name.clone()));
                        entry.status = PathStatus::Waiting;
                        entry.current_step = snapshot.step_name.clone();
                        if let Some(vars) = &snapshot.variables {
                            entry.variables = vars.clone();
                        }
                        guard.join_states.insert(
                            join_request.step_name.clone(),
                            JoinState {
                                step_name: join_request.step_name.clone(),
                                waiting_path_id: snapshot.path_id.clone(),
                                config: join_request.config,
                                created_at: Utc::now(),
                            },
                        );
                    }
                    if let Some(tx) = snapshot.resume_tx {
                        self.resume_senders.insert(snapshot.path_id.clone(), tx);
                    }
                }

                if self.is_join_ready(&join_request.step_name) {
                    tracing::info!(step = %join_request.step_name, "join ready");
                    self.resolve_join(&join_request.step_name).await?;
                }
                self.checkpoint().await;
            }
            SnapshotStatus::Completed => {
                {
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    let entry = guard
                        .path_states
                        .entry(snapshot.path_id.clone())
                        .or_insert_with(|| PathState::new(snapshot.path_id.clone(), snapshot.step_name.clone()));
                    entry.status = PathStatus::Completed;
                    entry.current_step = snapshot.step_name.clone();
                    entry.end_time = snapshot.end_time;
                    if let Some(vars) = &snapshot.variables {
                        entry.variables = vars.clone();
                    }
                    if let Some(out) = &snapshot.step_output {
                        entry.step_outputs.insert(snapshot.step_name.clone(), out.clone());
                    }
                }
                tracing::info!(path_id = %snapshot.path_id, "path completed");
                self.callbacks.after_path(&self.execution_id, &snapshot.path_id, PathStatus::Completed);
                for spec in &snapshot.new_paths {
                    self.spawn_child(&snapshot.path_id, spec.target_step.clone(), spec.variables.clone(), spec.label.as_deref())?;
                }
                self.resolve_ready_joins().await?;
                self.checkpoint().await;
            }
            SnapshotStatus::Running => {
                {
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    let entry = guard
                        .path_states
                        .entry(snapshot.path_id.clone())
                        .or_insert_with(|| PathState::new(snapshot.path_id.clone(), snapshot.step_name.clone()));
                    entry.status = PathStatus::Running;
                    entry.current_step = snapshot.step_name.clone();
                    if let Some(vars) = &snapshot.variables {
                        entry.variables = vars.clone();
                    }
                    if let Some(out) = &snapshot.step_output {
                        entry.step_outputs.insert(snapshot.step_name.clone(), out.clone());
                    }
                }
                for spec in &snapshot.new_paths {
                    self.spawn_child(&snapshot.path_id, spec.target_step.clone(), spec.variables.clone(), spec.label.as_deref())?;
                }
                self.checkpoint().await;
            }
        }
        Ok(())
    }

    fn active_path_count(&self) -> usize {
        let guard = self.state.read().expect("execution state lock poisoned");
        guard
            .path_states
            .values()
            .filter(|ps| matches!(ps.status, PathStatus::Pending | PathStatus::Running | PathStatus::Waiting))
            .count()
    }

    fn extract_outputs(&self) -> Result<HashMap<String, Value>, ExecutionError> {
        let guard = self.state.read().expect("execution state lock poisoned");
        let mut outputs = HashMap::new();
        for output in &self.workflow.outputs {
            let path_id = output.source_path();
            let ps = guard.path_states.get(path_id).ok_or_else(|| ExecutionError::MissingOutputPath {
                name: output.name.clone(),
                path: path_id.to_string(),
            })?;
            let root = Value::Object(ps.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
            let value = dotpath::get(&root, &output.variable).ok_or_else(|| ExecutionError::MissingOutputVariable {
                name: output.name.clone(),
                path: path_id.to_string(),
                variable: output.variable.clone(),
            })?;
            outputs.insert(output.name.clone(), value.clone());
        }
        Ok(outputs)
    }

    async fn finalize(&mut self) {
        let any_failed = {
            let guard = self.state.read().expect("execution state lock poisoned");
            guard.path_states.values().any(|ps| ps.status == PathStatus::Failed)
        };

        if any_failed || self.cancellation.is_cancelled() {
            let mut guard = self.state.write().expect("execution state lock poisoned");
            guard.status = ExecutionStatus::Failed;
            guard.end_time = Some(Utc::now());
            if guard.error.is_none() {
                guard.error = Some("execution failed".to_string());
            }
        } else {
            match self.extract_outputs() {
                Ok(outputs) => {
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    guard.outputs = outputs;
                    guard.status = ExecutionStatus::Completed;
                    guard.end_time = Some(Utc::now());
                }
                Err(e) => {
                    let mut guard = self.state.write().expect("execution state lock poisoned");
                    guard.status = ExecutionStatus::Failed;
                    guard.error = Some(e.to_string());
                    guard.end_time = Some(Utc::now());
                }
            }
        }

        let status = {
            let guard = self.state.read().expect("execution state lock poisoned");
            guard.status
        };
        tracing::info!(?status, "execution finished");
        self.callbacks
            .after_workflow(&self.execution_id, &self.workflow.name, status_label(status));
        self.checkpoint().await;
    }

    /// Run until every path has terminated (or execution is cancelled),
    /// then finalize outputs/status.
    pub async fn run(mut self, initial_paths: Vec<Path>) -> Result<(), ExecutionError> {
        let span = tracing::info_span!("execution", execution_id = %self.execution_id, workflow = %self.workflow.name);
        let _enter = span.enter();
        self.callbacks.before_workflow(&self.execution_id, &self.workflow.name);

        let (tx, mut rx) = mpsc::channel(self.config.snapshot_channel_capacity);
        self.snapshot_tx = tx;

        for path in initial_paths {
            self.spawn_path(path);
        }

        // No-op on a fresh run (no persisted joins yet); on resume this is
        // what catches a join that became ready while the execution was
        // offline.
        self.resolve_ready_joins().await?;

        if let Some(deadline) = self.deadline {
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline.into()).await;
                cancellation.cancel();
            });
        }

        loop {
            if self.active_path_count() == 0 {
                break;
            }
            let snapshot = tokio::select! {
                s = rx.recv() => s,
                _ = self.cancellation.cancelled() => None,
            };
            let Some(snapshot) = snapshot else { break };
            self.handle_snapshot(snapshot).await?;
        }

        drop(rx);
        while self.tasks.join_next().await.is_some() {}

        self.finalize().await;
        Ok(())
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}
