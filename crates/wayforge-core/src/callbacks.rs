//! Lifecycle notification sinks: `{before,after}` hooks at
//! workflow/path/activity granularity plus a dedicated failure hook, and a
//! combinator that broadcasts to several sinks at once.

use std::sync::Arc;

use serde_json::Value;

use wayforge_types::WorkflowError;
use wayforge_types::state::PathStatus;

/// Observes an execution's lifecycle. Every method has a no-op default, so
/// a sink implements only the hooks it cares about.
pub trait Callbacks: Send + Sync {
    fn before_workflow(&self, _execution_id: &str, _workflow_name: &str) {}
    fn after_workflow(&self, _execution_id: &str, _workflow_name: &str, _status: &str) {}

    fn before_path(&self, _execution_id: &str, _path_id: &str) {}
    fn after_path(&self, _execution_id: &str, _path_id: &str, _status: PathStatus) {}

    fn before_activity(&self, _execution_id: &str, _path_id: &str, _step_name: &str, _activity: &str) {}
    fn after_activity(
        &self,
        _execution_id: &str,
        _path_id: &str,
        _step_name: &str,
        _activity: &str,
        _result: &Value,
    ) {
    }

    fn on_failure(&self, _execution_id: &str, _path_id: &str, _step_name: &str, _error: &WorkflowError) {}
}

/// A no-op sink, useful as an `Engine` default when the host registers none
/// of its own.
pub struct NoopCallbacks;

impl Callbacks for NoopCallbacks {}

/// Fans every hook out to each sink in order. A panic in one sink would
/// abort the others, same as any direct call -- sinks are expected to be
/// infallible observers, not to influence control flow.
pub struct CallbackChain(Vec<Arc<dyn Callbacks>>);

impl CallbackChain {
    pub fn new(sinks: Vec<Arc<dyn Callbacks>>) -> Self {
        Self(sinks)
    }
}

impl Callbacks for CallbackChain {
    fn before_workflow(&self, execution_id: &str, workflow_name: &str) {
        for sink in &self.0 {
            sink.before_workflow(execution_id, workflow_name);
        }
    }

    fn after_workflow(&self, execution_id: &str, workflow_name: &str, status: &str) {
        for sink in &self.0 {
            sink.after_workflow(execution_id, workflow_name, status);
        }
    }

    fn before_path(&self, execution_id: &str, path_id: &str) {
        for sink in &self.0 {
            sink.before_path(execution_id, path_id);
        }
    }

    fn after_path(&self, execution_id: &str, path_id: &str, status: PathStatus) {
        for sink in &self.0 {
            sink.after_path(execution_id, path_id, status);
        }
    }

    fn before_activity(&self, execution_id: &str, path_id: &str, step_name: &str, activity: &str) {
        for sink in &self.0 {
            sink.before_activity(execution_id, path_id, step_name, activity);
        }
    }

    fn after_activity(
        &self,
        execution_id: &str,
        path_id: &str,
        step_name: &str,
        activity: &str,
        result: &Value,
    ) {
        for sink in &self.0 {
            sink.after_activity(execution_id, path_id, step_name, activity, result);
        }
    }

    fn on_failure(&self, execution_id: &str, path_id: &str, step_name: &str, error: &WorkflowError) {
        for sink in &self.0 {
            sink.on_failure(execution_id, path_id, step_name, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    impl Callbacks for RecordingSink {
        fn before_workflow(&self, _execution_id: &str, workflow_name: &str) {
            self.calls.lock().unwrap().push(format!("before:{workflow_name}"));
        }

        fn on_failure(&self, _execution_id: &str, path_id: &str, _step_name: &str, _error: &WorkflowError) {
            self.calls.lock().unwrap().push(format!("failure:{path_id}"));
        }
    }

    #[test]
    fn chain_forwards_to_every_sink() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let chain = CallbackChain::new(vec![a.clone(), b.clone()]);

        chain.before_workflow("exec-1", "wf");
        chain.on_failure("exec-1", "main", "step", &WorkflowError::activity_failed("boom"));

        assert_eq!(*a.calls.lock().unwrap(), vec!["before:wf", "failure:main"]);
        assert_eq!(*b.calls.lock().unwrap(), vec!["before:wf", "failure:main"]);
    }

    #[test]
    fn noop_callbacks_never_panics() {
        let sink = NoopCallbacks;
        sink.before_workflow("exec", "wf");
        sink.after_path("exec", "main", PathStatus::Completed);
    }
}
