//! The engine facade: wires a validated [`Workflow`] and an
//! [`ActivityRegistry`] to the orchestrator, exposing `NewExecution` + `Run`
//! as [`Engine::run`] and `Resume` as [`Engine::resume`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wayforge_types::state::{ExecutionState, ExecutionStatus, PathState, PathStatus};
use wayforge_types::workflow::{Workflow, MAIN_PATH};

use crate::activity::ActivityRegistry;
use crate::activity_log::{ActivityLogger, NoopActivityLogger};
use crate::callbacks::{Callbacks, NoopCallbacks};
use crate::checkpoint::{Checkpointer, InMemoryCheckpointer};
use crate::config::EngineConfig;
use crate::error::{CheckpointError, ExecutionError};
use crate::orchestrator::RunLoop;
use crate::path::Path;
use crate::templating::{Compiler, JexlCompiler};

/// Runs a [`Workflow`] against a supplied [`ActivityRegistry`]. Construct
/// with [`Engine::new`] and override collaborators with the `with_*`
/// builder methods; every collaborator has an in-process default, so a
/// minimal engine needs only a workflow and a registry.
pub struct Engine {
    workflow: Arc<Workflow>,
    registry: Arc<ActivityRegistry>,
    compiler: Arc<dyn Compiler>,
    config: Arc<EngineConfig>,
    checkpointer: Arc<dyn Checkpointer>,
    callbacks: Arc<dyn Callbacks>,
    activity_logger: Arc<dyn ActivityLogger>,
}

impl Engine {
    pub fn new(workflow: Arc<Workflow>, registry: Arc<ActivityRegistry>) -> Self {
        Self {
            workflow,
            registry,
            compiler: Arc::new(JexlCompiler::new()),
            config: Arc::new(EngineConfig::default()),
            checkpointer: Arc::new(InMemoryCheckpointer::new()),
            callbacks: Arc::new(NoopCallbacks),
            activity_logger: Arc::new(NoopActivityLogger),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn Callbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_activity_logger(mut self, logger: Arc<dyn ActivityLogger>) -> Self {
        self.activity_logger = logger;
        self
    }

    /// Applies declared input defaults and checks required inputs before
    /// an execution starts.
    fn resolve_inputs(&self, mut inputs: HashMap<String, Value>) -> Result<HashMap<String, Value>, ExecutionError> {
        for input in &self.workflow.inputs {
            if inputs.contains_key(&input.name) {
                continue;
            }
            match &input.default {
                Some(default) => {
                    inputs.insert(input.name.clone(), default.clone());
                }
                None if input.required => {
                    return Err(ExecutionError::MissingRequiredInput(input.name.clone()));
                }
                None => {}
            }
        }
        Ok(inputs)
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.default_workflow_deadline().map(|d| Instant::now() + d)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_run_loop(
        &self,
        state: Arc<RwLock<ExecutionState>>,
        inputs: Arc<Value>,
        execution_id: String,
        starting_checkpoint_id: u64,
    ) -> RunLoop {
        RunLoop::new(
            self.workflow.clone(),
            self.registry.clone(),
            self.compiler.clone(),
            self.config.clone(),
            self.checkpointer.clone(),
            self.callbacks.clone(),
            self.activity_logger.clone(),
            state,
            CancellationToken::new(),
            self.deadline(),
            inputs,
            execution_id,
            starting_checkpoint_id,
        )
    }

    /// `NewExecution` + `Run`: creates a
    /// fresh `ExecutionState` seeded with the workflow's initial variables
    /// on the main path, then drives every path to a terminal status.
    pub async fn run(&self, inputs: HashMap<String, Value>) -> Result<ExecutionState, ExecutionError> {
        let inputs = self.resolve_inputs(inputs)?;
        let execution_id = Uuid::now_v7().to_string();
        let start_step = self.workflow.start_step().name.clone();

        let mut state = ExecutionState::new(execution_id.clone(), self.workflow.name.clone(), inputs.clone());
        let mut main_path = PathState::new(MAIN_PATH, start_step.clone());
        main_path.variables = self.workflow.variables.clone();
        state.path_states.insert(MAIN_PATH.to_string(), main_path);
        let state = Arc::new(RwLock::new(state));

        let inputs_value = Arc::new(Value::Object(inputs.into_iter().collect()));
        let run_loop = self.build_run_loop(state.clone(), inputs_value.clone(), execution_id, 0);

        let initial_path = Path::new(MAIN_PATH, start_step, self.workflow.variables.clone(), inputs_value);
        run_loop.run(vec![initial_path]).await?;

        Ok(state.read().expect("execution state lock poisoned").clone())
    }

    /// `Resume`: reconstruct an execution from its latest
    /// checkpoint under a fresh execution id and continue driving it.
    pub async fn resume(&self, prior_execution_id: impl Into<String>) -> Result<ExecutionState, ExecutionError> {
        let prior_execution_id = prior_execution_id.into();
        let checkpoint = self.checkpointer.load(&prior_execution_id).await?;
        let checkpoint = checkpoint.ok_or_else(|| CheckpointError::NotFound(prior_execution_id.clone()))?;

        let mut restored = checkpoint.to_state();
        let execution_id = Uuid::now_v7().to_string();
        restored.execution_id = execution_id.clone();

        if restored.status == ExecutionStatus::Completed {
            return Ok(restored);
        }

        if restored.status == ExecutionStatus::Failed {
            self.reset_failed_paths(&mut restored);
            restored.error = None;
            restored.status = ExecutionStatus::Running;
        }
        restored.end_time = None;

        let inputs_value = Arc::new(Value::Object(restored.inputs.clone().into_iter().collect()));
        let initial_paths: Vec<Path> = restored
            .path_states
            .values()
            .filter(|ps| matches!(ps.status, PathStatus::Pending | PathStatus::Running | PathStatus::Waiting))
            .map(|ps| Path::new(ps.id.clone(), ps.current_step.clone(), ps.variables.clone(), inputs_value.clone()))
            .collect();

        let state = Arc::new(RwLock::new(restored));
        let run_loop = self.build_run_loop(state.clone(), inputs_value, execution_id, checkpoint.id);

        // `RunLoop::run` re-checks every pending join before its first
        // iteration, which is what catches a join that became ready while
        // this execution was offline.
        run_loop.run(initial_paths).await?;

        Ok(state.read().expect("execution state lock poisoned").clone())
    }

    /// Reset failed paths to a sensible restart point:
    /// the failing step itself if it still exists, else the first
    /// successor of any step with a recorded output, else the workflow's
    /// start step.
    fn reset_failed_paths(&self, state: &mut ExecutionState) {
        let start_step = self.workflow.start_step().name.clone();
        for ps in state.path_states.values_mut() {
            if ps.status != PathStatus::Failed {
                continue;
            }
            let restart = if self.workflow.step(&ps.current_step).is_some() {
                ps.current_step.clone()
            } else {
                self.first_successor_with_recorded_output(ps).unwrap_or_else(|| start_step.clone())
            };
            ps.status = PathStatus::Pending;
            ps.current_step = restart;
            ps.error = None;
            ps.end_time = None;
        }
    }

    fn first_successor_with_recorded_output(&self, ps: &PathState) -> Option<String> {
        ps.step_outputs
            .keys()
            .filter_map(|step_name| self.workflow.step(step_name))
            .find_map(|step| step.edges.first().map(|edge| edge.target.clone()))
    }
}
