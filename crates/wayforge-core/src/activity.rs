//! The activity interface: the one seam every workflow author
//! implements against. The registry holds activities as `Arc<dyn Activity>`,
//! so `execute` returns a boxed future rather than using a native `async fn`
//! in the trait -- `async fn` in traits isn't object-safe, so any trait
//! that needs dynamic dispatch returns `BoxFuture` instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use wayforge_types::WorkflowError;
use wayforge_types::error::KIND_ACTIVITY_FAILED;

use crate::templating::Compiler;

/// Context handed to an activity for a single invocation attempt. Built
/// fresh per attempt so `attempt`-scoped fields (none yet, but the shape
/// leaves room) never leak across retries.
pub struct ActivityContext {
    path_id: String,
    step_name: String,
    inputs: Arc<Value>,
    variables: Arc<Mutex<HashMap<String, Value>>>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    compiler: Arc<dyn Compiler>,
}

impl ActivityContext {
    pub fn new(
        path_id: impl Into<String>,
        step_name: impl Into<String>,
        inputs: Arc<Value>,
        variables: Arc<Mutex<HashMap<String, Value>>>,
        cancellation: CancellationToken,
        deadline: Option<Instant>,
        compiler: Arc<dyn Compiler>,
    ) -> Self {
        Self {
            path_id: path_id.into(),
            step_name: step_name.into(),
            inputs,
            variables,
            cancellation,
            deadline,
            compiler,
        }
    }

    pub fn path_id(&self) -> &str {
        &self.path_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Read-only view of the workflow's inputs.
    pub fn inputs(&self) -> &Value {
        &self.inputs
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

    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.variables
            .lock()
            .expect("path variables lock poisoned")
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the execution is cancelled (deadline exceeded, a
    /// sibling path failed fatally, or an explicit `Cancel` call).
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }
}

/// An activity: a named unit of work a step's `activity` field resolves
/// against in an [`ActivityRegistry`].
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    fn execute<'a>(
        &'a self,
        ctx: &'a ActivityContext,
        params: HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>>;
}

/// An activity whose input/output are concrete Rust types rather than raw
/// JSON, adapted onto [`Activity`] via a JSON round-trip through
/// [`TypedActivityAdapter`].
pub trait TypedActivity: Send + Sync {
    const NAME: &'static str;
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn execute_typed(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}

pub struct TypedActivityAdapter<T>(pub T);

impl<T: TypedActivity + Send + Sync> Activity for TypedActivityAdapter<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a ActivityContext,
        params: HashMap<String, Value>,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let input: T::Input = serde_json::from_value(Value::Object(params.into_iter().collect()))
                .map_err(|e| WorkflowError::wrap(KIND_ACTIVITY_FAILED, e))?;
            let output = self.0.execute_typed(ctx, input).await?;
            serde_json::to_value(output).map_err(|e| WorkflowError::wrap(KIND_ACTIVITY_FAILED, e))
        })
    }
}

/// Name -> activity lookup. Registering a name that's already present
/// overwrites the previous entry.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities.insert(activity.name().to_string(), activity);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Activity for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a ActivityContext,
            params: HashMap<String, Value>,
        ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
            Box::pin(async move { Ok(Value::Object(params.into_iter().collect())) })
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_name() {
        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_overwrites() {
        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Echo));
        assert_eq!(registry.activities.len(), 1);
    }

    #[tokio::test]
    async fn context_reads_and_writes_path_variables() {
        let variables = Arc::new(Mutex::new(HashMap::new()));
        let ctx = ActivityContext::new(
            "main",
            "step-a",
            Arc::new(Value::Null),
            variables,
            CancellationToken::new(),
            None,
            Arc::new(crate::templating::JexlCompiler::new()),
        );
        ctx.set_variable("x", Value::from(1));
        assert_eq!(ctx.get_variable("x"), Some(Value::from(1)));
        assert!(!ctx.is_cancelled());
    }
}
