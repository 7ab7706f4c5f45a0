//! Persisted execution state: `PathState`, `JoinState`, `ExecutionState`,
//! and the checkpoint payload shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
}

/// Status of an entire execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// The persisted view of a single path, as stored in `ExecutionState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathState {
    pub id: String,
    pub status: PathStatus,
    pub current_step: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl PathState {
    pub fn new(id: impl Into<String>, current_step: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PathStatus::Pending,
            current_step: current_step.into(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
            step_outputs: HashMap::new(),
            variables: HashMap::new(),
        }
    }
}

/// The persisted view of a pending join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinState {
    pub step_name: String,
    pub waiting_path_id: String,
    pub config: crate::workflow::JoinConfig,
    pub created_at: DateTime<Utc>,
}

/// The aggregate persisted state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub path_counter: u64,
    pub path_states: HashMap<String, PathState>,
    #[serde(default)]
    pub join_states: HashMap<String, JoinState>,
}

impl ExecutionState {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_name: impl Into<String>,
        inputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_name: workflow_name.into(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            inputs,
            outputs: HashMap::new(),
            path_counter: 0,
            path_states: HashMap::new(),
            join_states: HashMap::new(),
        }
    }
}

/// The on-the-wire checkpoint payload: `ExecutionState` plus a
/// monotonic checkpoint id and the timestamp it was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub execution_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Reserved, always empty -- execution-scoped variables live on
    /// individual `PathState`s instead.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub path_counter: u64,
    pub path_states: HashMap<String, PathState>,
    #[serde(default)]
    pub join_states: HashMap<String, JoinState>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub checkpoint_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Checkpoint {
    /// Project an `ExecutionState` plus checkpoint id into the wire payload.
    pub fn from_state(state: &ExecutionState, id: u64) -> Self {
        Self {
            id,
            execution_id: state.execution_id.clone(),
            workflow_name: state.workflow_name.clone(),
            status: state.status,
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            variables: HashMap::new(),
            path_counter: state.path_counter,
            path_states: state.path_states.clone(),
            join_states: state.join_states.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            checkpoint_at: Utc::now(),
            error: state.error.clone(),
        }
    }

    /// Reconstruct the `ExecutionState` that produced this checkpoint,
    /// discarding the checkpoint id and timestamp.
    pub fn to_state(&self) -> ExecutionState {
        ExecutionState {
            execution_id: self.execution_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            path_counter: self.path_counter,
            path_states: self.path_states.clone(),
            join_states: self.join_states.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_roundtrip_preserves_state() {
        let mut state = ExecutionState::new("exec-1", "wf", HashMap::new());
        state
            .path_states
            .insert("main".to_string(), PathState::new("main", "start"));
        state.path_counter = 3;

        let checkpoint = Checkpoint::from_state(&state, 1);
        let restored = checkpoint.to_state();

        assert_eq!(restored.execution_id, state.execution_id);
        assert_eq!(restored.path_counter, state.path_counter);
        assert_eq!(restored.path_states.len(), state.path_states.len());
    }

    #[test]
    fn new_execution_state_defaults_to_running() {
        let state = ExecutionState::new("exec-1", "wf", HashMap::new());
        assert_eq!(state.status, ExecutionStatus::Running);
        assert!(state.path_states.is_empty());
        assert!(state.join_states.is_empty());
    }
}
