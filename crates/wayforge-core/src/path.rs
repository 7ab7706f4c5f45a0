//! Runtime path state: the live, in-task counterpart to the
//! persisted [`wayforge_types::state::PathState`]. A `Path` lives entirely
//! on the tokio task driving it; its variables are wrapped in a `Mutex`
//! only so an [`crate::activity::ActivityContext`] built for an activity
//! invocation can share them without a borrow, not because more than one
//! task ever touches them concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

/// A path's identifier doubles as its label for edge-matching purposes: a
/// path spawned with label `"a"` has id `"a"`; an auto-generated path has
/// an id like `"main-1"` and no label anything could address directly.
pub struct Path {
    pub id: String,
    pub current_step: String,
    pub variables: Arc<Mutex<HashMap<String, Value>>>,
    pub inputs: Arc<Value>,
}

impl Path {
    pub fn new(
        id: impl Into<String>,
        current_step: impl Into<String>,
        variables: HashMap<String, Value>,
        inputs: Arc<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            current_step: current_step.into(),
            variables: Arc::new(Mutex::new(variables)),
            inputs,
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables
            .lock()
            .expect("path variables lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables
            .lock()
            .expect("path variables lock poisoned")
            .insert(name.into(), value);
    }

    pub fn remove_variable(&self, name: &str) {
        self.variables
            .lock()
            .expect("path variables lock poisoned")
            .remove(name);
    }

    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.variables
            .lock()
            .expect("path variables lock poisoned")
            .clone()
    }

    /// The `{"inputs": ..., "state": ...}` globals object every template,
    /// condition and script expression evaluates against.
    pub fn script_globals(&self) -> Value {
        json!({
            "inputs": self.inputs.as_ref(),
            "state": self.variables_snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_globals_reflect_inputs_and_state() {
        let path = Path::new(
            "main",
            "start",
            HashMap::from([("count".to_string(), json!(1))]),
            Arc::new(json!({"user": "ada"})),
        );
        let globals = path.script_globals();
        assert_eq!(globals["inputs"]["user"], json!("ada"));
        assert_eq!(globals["state"]["count"], json!(1));
    }

    #[test]
    fn set_and_remove_variable_round_trip() {
        let path = Path::new("main", "start", HashMap::new(), Arc::new(json!({})));
        path.set_variable("x", json!(42));
        assert_eq!(path.get_variable("x"), Some(json!(42)));
        path.remove_variable("x");
        assert_eq!(path.get_variable("x"), None);
    }
}
