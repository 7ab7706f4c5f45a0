//! One step's execution sequence: resolve the activity,
//! template its parameters, expand `each` iteration, invoke with retry,
//! redirect through a matching catch handler on exhaustion, store the
//! result, then evaluate outgoing edges. Join steps never reach this
//! module -- the path runtime intercepts a step with a `join` config before
//! calling here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use chrono::Utc;
use wayforge_types::WorkflowError;
use wayforge_types::error::KIND_ACTIVITY_FAILED;
use wayforge_types::workflow::{Edge, EdgeMatchingStrategy, EachConfig, ItemsSource, Step};

use crate::activity::{Activity, ActivityContext, ActivityRegistry};
use crate::activity_log::{ActivityLogEntry, ActivityLogger};
use crate::callbacks::Callbacks;
use crate::config::EngineConfig;
use crate::error::{ExecutionError, TemplateError};
use crate::path::Path;
use crate::retry::RetryHandler;
use crate::templating::{Compiler, evaluate_condition, template_value};

/// What a step run decided to do next.
pub enum StepOutcome {
    /// Evaluate these matched edges to classify linear/fan-out/terminal
    /// continuation. Empty means terminal.
    Edges(Vec<Edge>),
    /// A catch handler redirected this path directly to `next`; no edge
    /// evaluation happens.
    CaughtRedirect(String),
    /// The step failed with no matching catch handler, or fatally.
    Failed(WorkflowError),
}

pub struct StepRunOutput {
    pub outcome: StepOutcome,
    pub step_output: Option<Value>,
}

/// Evaluate a step's outgoing edges against `globals`, honoring its
/// matching strategy: `All` collects every matching
/// edge, `First` stops at the first.
pub fn evaluate_edges(
    step: &Step,
    globals: &Value,
    compiler: &dyn Compiler,
) -> Result<Vec<Edge>, TemplateError> {
    let mut matched = Vec::new();
    for edge in &step.edges {
        let is_match = match &edge.condition {
            None => true,
            Some(condition) => evaluate_condition(compiler, condition, globals)?,
        };
        if is_match {
            matched.push(edge.clone());
            if step.edge_matching_strategy == EdgeMatchingStrategy::First {
                break;
            }
        }
    }
    Ok(matched)
}

fn resolve_each_items(
    each: &EachConfig,
    compiler: &dyn Compiler,
    globals: &Value,
) -> Result<Vec<Value>, TemplateError> {
    let resolved = match &each.items {
        ItemsSource::Literal(v) => v.clone(),
        ItemsSource::Expression(source) => compiler.compile(source)?.evaluate(globals)?,
    };
    Ok(match resolved {
        Value::Array(items) => items,
        scalar => vec![scalar],
    })
}

fn step_params(step: &Step) -> Value {
    Value::Object(step.parameters.clone().into_iter().collect())
}

fn per_attempt_timeout(
    policy: Option<&wayforge_types::workflow::RetryConfig>,
    config: &EngineConfig,
) -> std::time::Duration {
    policy
        .and_then(|c| c.timeout())
        .unwrap_or_else(|| config.default_activity_timeout())
}

#[allow(clippy::too_many_arguments)]
async fn invoke_once(
    activity: &dyn Activity,
    ctx: &ActivityContext,
    params: HashMap<String, Value>,
    timeout: std::time::Duration,
) -> Result<Value, WorkflowError> {
    match tokio::time::timeout(timeout, activity.execute(ctx, params)).await {
        Ok(result) => result,
        Err(_) => Err(WorkflowError::timeout(format!(
            "activity '{}' exceeded its {timeout:?} attempt timeout",
            activity.name()
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn invoke_with_retry(
    step: &Step,
    path: &Path,
    activity: &dyn Activity,
    params: HashMap<String, Value>,
    compiler: &Arc<dyn Compiler>,
    config: &EngineConfig,
    cancellation: &CancellationToken,
    deadline: Option<Instant>,
    execution_id: &str,
    logger: &Arc<dyn ActivityLogger>,
    callbacks: &Arc<dyn Callbacks>,
) -> Result<Value, WorkflowError> {
    let mut attempt: u32 = 0;
    let mut policy: Option<&wayforge_types::workflow::RetryConfig> = None;

    loop {
        if cancellation.is_cancelled() {
            return Err(WorkflowError::timeout("execution cancelled"));
        }

        let ctx = ActivityContext::new(
            path.id.clone(),
            step.name.clone(),
            path.inputs.clone(),
            path.variables.clone(),
            cancellation.clone(),
            deadline,
            compiler.clone(),
        );
        let timeout = per_attempt_timeout(policy, config);

        callbacks.before_activity(execution_id, &path.id, &step.name, activity.name());
        let attempt_start = Utc::now();
        let started = Instant::now();
        let outcome = tokio::select! {
            res = invoke_once(activity, &ctx, params.clone(), timeout) => res,
            _ = cancellation.cancelled() => Err(WorkflowError::timeout("execution cancelled")),
        };
        if let Ok(value) = &outcome {
            callbacks.after_activity(execution_id, &path.id, &step.name, activity.name(), value);
        }
        logger
            .append(ActivityLogEntry::new(
                execution_id.to_string(),
                activity.name().to_string(),
                step.name.clone(),
                path.id.clone(),
                params.clone(),
                &outcome,
                attempt_start,
                started.elapsed().as_secs_f64(),
            ))
            .await;

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_fatal() {
                    return Err(err);
                }
                if policy.is_none() {
                    policy = RetryHandler::select_policy(&step.retry, &err);
                }
                let Some(selected) = policy else {
                    return Err(err);
                };
                attempt += 1;
                if !RetryHandler::should_retry(selected, attempt, &err) {
                    return Err(err);
                }
                tracing::warn!(step = %step.name, attempt, error = %err, "activity failed, retrying");
                let delay = RetryHandler::delay_for_attempt(selected, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => return Err(WorkflowError::timeout("execution cancelled")),
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_single(
    step: &Step,
    path: &Path,
    activity: &dyn Activity,
    compiler: &Arc<dyn Compiler>,
    config: &EngineConfig,
    cancellation: &CancellationToken,
    deadline: Option<Instant>,
    execution_id: &str,
    logger: &Arc<dyn ActivityLogger>,
    callbacks: &Arc<dyn Callbacks>,
) -> Result<Value, WorkflowError> {
    let globals = path.script_globals();
    let templated = template_value(compiler.as_ref(), &step_params(step), &globals)
        .map_err(|e| WorkflowError::wrap(KIND_ACTIVITY_FAILED, e))?;
    let params: HashMap<String, Value> = match templated {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    invoke_with_retry(
        step,
        path,
        activity,
        params,
        compiler,
        config,
        cancellation,
        deadline,
        execution_id,
        logger,
        callbacks,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_each(
    step: &Step,
    each: &EachConfig,
    path: &Path,
    activity: Option<&dyn Activity>,
    compiler: &Arc<dyn Compiler>,
    config: &EngineConfig,
    cancellation: &CancellationToken,
    deadline: Option<Instant>,
    execution_id: &str,
    logger: &Arc<dyn ActivityLogger>,
    callbacks: &Arc<dyn Callbacks>,
) -> Result<Value, WorkflowError> {
    let globals = path.script_globals();
    let items = resolve_each_items(each, compiler.as_ref(), &globals)
        .map_err(|e| WorkflowError::wrap(KIND_ACTIVITY_FAILED, e))?;

    if items.len() > config.max_each_fanout {
        return Err(WorkflowError::new(
            KIND_ACTIVITY_FAILED,
            format!(
                "each over {} items exceeds the configured maximum of {}",
                items.len(),
                config.max_each_fanout
            ),
        ));
    }

    let loop_var = each.r#as.clone();
    let previous = path.get_variable(&loop_var);
    let mut results = Vec::with_capacity(items.len());
    let mut failure: Option<WorkflowError> = None;

    for item in items {
        path.set_variable(loop_var.clone(), item);
        let iteration_globals = path.script_globals();
        let templated = template_value(compiler.as_ref(), &step_params(step), &iteration_globals)
            .map_err(|e| WorkflowError::wrap(KIND_ACTIVITY_FAILED, e));

        let item_result = match templated {
            Err(e) => Err(e),
            Ok(Value::Object(map)) => {
                let params: HashMap<String, Value> = map.into_iter().collect();
                match activity {
                    Some(a) => {
                        invoke_with_retry(
                            step,
                            path,
                            a,
                            params,
                            compiler,
                            config,
                            cancellation,
                            deadline,
                            execution_id,
                            logger,
                            callbacks,
                        )
                        .await
                    }
                    None => Ok(path.get_variable(&loop_var).unwrap_or(Value::Null)),
                }
            }
            Ok(_) => Ok(Value::Null),
        };

        match item_result {
            Ok(value) => results.push(value),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    match previous {
        Some(value) => path.set_variable(loop_var, value),
        None => path.remove_variable(&loop_var),
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(Value::Array(results)),
    }
}

/// Run one step to completion. `workflow`-level lookups (activity
/// resolution) stay in `registry`; this function never touches
/// path-runtime concerns like fan-out or joins.
#[allow(clippy::too_many_arguments)]
pub async fn execute_step(
    step: &Step,
    path: &Path,
    registry: &ActivityRegistry,
    compiler: &Arc<dyn Compiler>,
    config: &EngineConfig,
    cancellation: &CancellationToken,
    deadline: Option<Instant>,
    execution_id: &str,
    logger: &Arc<dyn ActivityLogger>,
    callbacks: &Arc<dyn Callbacks>,
) -> Result<StepRunOutput, ExecutionError> {
    if step.is_decision_only() {
        let globals = path.script_globals();
        return Ok(
            match evaluate_edges(step, &globals, compiler.as_ref()) {
                Ok(edges) => StepRunOutput {
                    outcome: StepOutcome::Edges(edges),
                    step_output: None,
                },
                Err(err) => finish_with_error(
                    step,
                    path,
                    WorkflowError::wrap(KIND_ACTIVITY_FAILED, err),
                ),
            },
        );
    }

    let activity = match &step.activity {
        Some(name) => Some(
            registry
                .get(name)
                .ok_or_else(|| ExecutionError::UnknownActivity(name.clone()))?,
        ),
        None => None,
    };

    let result: Result<Value, WorkflowError> = if let Some(each) = &step.each {
        run_each(
            step,
            each,
            path,
            activity.as_deref(),
            compiler,
            config,
            cancellation,
            deadline,
            execution_id,
            logger,
            callbacks,
        )
        .await
    } else {
        let activity = activity.as_deref().expect("non-decision, non-each step requires an activity");
        run_single(
            step,
            path,
            activity,
            compiler,
            config,
            cancellation,
            deadline,
            execution_id,
            logger,
            callbacks,
        )
        .await
    };

    match result {
        Ok(value) => {
            if let Some(var) = &step.store {
                path.set_variable(var.clone(), value.clone());
            }
            let globals = path.script_globals();
            Ok(match evaluate_edges(step, &globals, compiler.as_ref()) {
                Ok(edges) => StepRunOutput {
                    outcome: StepOutcome::Edges(edges),
                    step_output: Some(value),
                },
                Err(err) => finish_with_error(
                    step,
                    path,
                    WorkflowError::wrap(KIND_ACTIVITY_FAILED, err),
                ),
            })
        }
        Err(err) => Ok(finish_with_error(step, path, err)),
    }
}

/// Classify a step-level failure against `step.catch`, producing either a
/// caught redirect or a terminal failure. Shared by activity-invocation
/// failures and edge/condition-evaluation failures alike, so both honor the
/// same `catch` semantics.
fn finish_with_error(step: &Step, path: &Path, err: WorkflowError) -> StepRunOutput {
    if err.is_fatal() {
        tracing::error!(step = %step.name, error = %err, "step failed fatally");
        return StepRunOutput {
            outcome: StepOutcome::Failed(err),
            step_output: None,
        };
    }
    match step.catch.iter().find(|c| err.matches(&c.error_equals)) {
        Some(catch) => {
            if let Some(var) = &catch.store {
                path.set_variable(var.clone(), err.to_error_output());
            }
            tracing::warn!(step = %step.name, target = %catch.next, error = %err, "step failed, caught");
            StepRunOutput {
                outcome: StepOutcome::CaughtRedirect(catch.next.clone()),
                step_output: None,
            }
        }
        None => {
            tracing::error!(step = %step.name, error = %err, "step exhausted retries with no matching catch handler");
            StepRunOutput {
                outcome: StepOutcome::Failed(err),
                step_output: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wayforge_types::workflow::{CatchConfig, Jitter, RetryConfig};

    use crate::activity_log::InMemoryActivityLog;
    use crate::callbacks::NoopCallbacks;
    use crate::templating::JexlCompiler;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);

    impl Activity for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a ActivityContext,
            params: HashMap<String, Value>,
        ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
            Box::pin(async move {
                let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"attempt": n, "echo": params.get("x").cloned()}))
            })
        }
    }

    struct AlwaysFails;

    impl Activity for AlwaysFails {
        fn name(&self) -> &str {
            "fails"
        }

        fn execute<'a>(
            &'a self,
            _ctx: &'a ActivityContext,
            _params: HashMap<String, Value>,
        ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
            Box::pin(async move { Err(WorkflowError::activity_failed("boom")) })
        }
    }

    fn setup() -> (
        ActivityRegistry,
        Arc<dyn Compiler>,
        EngineConfig,
        CancellationToken,
        Arc<dyn ActivityLogger>,
        Arc<dyn Callbacks>,
    ) {
        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(Counter(AtomicU32::new(0))));
        registry.register(Arc::new(AlwaysFails));
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let logger: Arc<dyn ActivityLogger> = Arc::new(InMemoryActivityLog::new());
        let callbacks: Arc<dyn Callbacks> = Arc::new(NoopCallbacks);
        (registry, compiler, EngineConfig::default(), CancellationToken::new(), logger, callbacks)
    }

    #[tokio::test]
    async fn decision_only_step_evaluates_edges_without_an_activity() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("gate");
        step.edges.push(Edge::to("next").when("true"));
        let path = Path::new("main", "gate", HashMap::new(), Arc::new(json!({})));

        let result = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        match result.outcome {
            StepOutcome::Edges(edges) => assert_eq!(edges.len(), 1),
            _ => panic!("expected edges"),
        }
    }

    #[tokio::test]
    async fn stores_activity_output_and_evaluates_edges() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("do");
        step.activity = Some("counter".to_string());
        step.parameters.insert("x".to_string(), json!("${state.name}"));
        step.store = Some("result".to_string());
        step.edges.push(Edge::to("next"));

        let path = Path::new(
            "main",
            "do",
            HashMap::from([("name".to_string(), json!("ada"))]),
            Arc::new(json!({})),
        );

        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        assert_eq!(path.get_variable("result").unwrap()["echo"], json!("ada"));
        assert!(matches!(output.outcome, StepOutcome::Edges(edges) if edges.len() == 1));
    }

    #[tokio::test]
    async fn records_each_attempt_in_the_activity_log() {
        let mut registry = ActivityRegistry::new();
        registry.register(Arc::new(Counter(AtomicU32::new(0))));
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = EngineConfig::default();
        let cancellation = CancellationToken::new();
        let log = Arc::new(InMemoryActivityLog::new());
        let logger: Arc<dyn ActivityLogger> = log.clone();
        let callbacks: Arc<dyn Callbacks> = Arc::new(NoopCallbacks);

        let mut step = Step::new("do");
        step.activity = Some("counter".to_string());
        step.store = Some("result".to_string());
        let path = Path::new("main", "do", HashMap::new(), Arc::new(json!({})));

        execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-7", &logger, &callbacks,
        )
        .await
        .unwrap();

        let entries = log.entries_for("exec-7");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].activity, "counter");
        assert_eq!(entries[0].step_name, "do");
        assert!(entries[0].error.is_none());
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_max_retries() {
        let mut registry = ActivityRegistry::new();
        struct FailsTwice(AtomicU32);
        impl Activity for FailsTwice {
            fn name(&self) -> &str {
                "flaky"
            }
            fn execute<'a>(
                &'a self,
                _ctx: &'a ActivityContext,
                _params: HashMap<String, Value>,
            ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
                Box::pin(async move {
                    let n = self.0.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(WorkflowError::activity_failed("not yet"))
                    } else {
                        Ok(json!("ok"))
                    }
                })
            }
        }
        registry.register(Arc::new(FailsTwice(AtomicU32::new(0))));
        let compiler: Arc<dyn Compiler> = Arc::new(JexlCompiler::new());
        let config = EngineConfig::default();
        let cancellation = CancellationToken::new();
        let logger: Arc<dyn ActivityLogger> = Arc::new(InMemoryActivityLog::new());
        let callbacks: Arc<dyn Callbacks> = Arc::new(NoopCallbacks);

        let mut step = Step::new("do");
        step.activity = Some("flaky".to_string());
        step.retry.push(RetryConfig {
            error_equals: vec![],
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_rate: 2.0,
            jitter: Jitter::None,
            timeout_ms: None,
        });
        let path = Path::new("main", "do", HashMap::new(), Arc::new(json!({})));

        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        assert!(matches!(output.outcome, StepOutcome::Edges(_)));
        assert_eq!(output.step_output, Some(json!("ok")));
    }

    #[tokio::test]
    async fn exhausted_retries_with_no_catch_fails() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("do");
        step.activity = Some("fails".to_string());
        step.retry.push(RetryConfig {
            error_equals: vec![],
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            backoff_rate: 1.0,
            jitter: Jitter::None,
            timeout_ms: None,
        });

        let path = Path::new("main", "do", HashMap::new(), Arc::new(json!({})));
        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        assert!(matches!(output.outcome, StepOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn catch_handler_redirects_and_stores_error_output() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("do");
        step.activity = Some("fails".to_string());
        step.catch.push(CatchConfig {
            error_equals: vec![],
            next: "handle-error".to_string(),
            store: Some("err".to_string()),
        });

        let path = Path::new("main", "do", HashMap::new(), Arc::new(json!({})));
        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        match output.outcome {
            StepOutcome::CaughtRedirect(next) => assert_eq!(next, "handle-error"),
            _ => panic!("expected a caught redirect"),
        }
        assert_eq!(path.get_variable("err").unwrap()["Error"], json!("ACTIVITY_FAILED"));
    }

    #[tokio::test]
    async fn each_iterates_and_restores_the_loop_variable() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("do");
        step.activity = Some("counter".to_string());
        step.parameters.insert("x".to_string(), json!("$(item)"));
        step.store = Some("results".to_string());
        step.each = Some(EachConfig {
            items: ItemsSource::Literal(json!([1, 2, 3])),
            r#as: "item".to_string(),
        });

        let path = Path::new(
            "main",
            "do",
            HashMap::from([("item".to_string(), json!("previous"))]),
            Arc::new(json!({})),
        );

        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();
        let stored = path.get_variable("results").unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 3);
        // loop variable restored to its pre-loop value afterward.
        assert_eq!(path.get_variable("item"), Some(json!("previous")));
        assert!(matches!(output.outcome, StepOutcome::Edges(_)));
    }

    #[tokio::test]
    async fn each_over_an_empty_sequence_stores_empty_and_still_advances() {
        let (registry, compiler, config, cancellation, logger, callbacks) = setup();
        let mut step = Step::new("do");
        step.activity = Some("counter".to_string());
        step.store = Some("results".to_string());
        step.each = Some(EachConfig {
            items: ItemsSource::Literal(json!([])),
            r#as: "item".to_string(),
        });
        step.edges.push(Edge::to("next"));

        let path = Path::new("main", "do", HashMap::new(), Arc::new(json!({})));
        let output = execute_step(
            &step, &path, &registry, &compiler, &config, &cancellation, None, "exec-1", &logger, &callbacks,
        )
        .await
        .unwrap();

        assert_eq!(path.get_variable("results"), Some(json!([])));
        match output.outcome {
            StepOutcome::Edges(edges) => assert_eq!(edges.len(), 1),
            _ => panic!("expected the single outgoing edge to still be taken"),
        }
    }

    #[test]
    fn first_strategy_stops_at_first_match() {
        let compiler = JexlCompiler::new();
        let mut step = Step::new("gate");
        step.edge_matching_strategy = EdgeMatchingStrategy::First;
        step.edges.push(Edge::to("a").when("true"));
        step.edges.push(Edge::to("b").when("true"));
        let matched = evaluate_edges(&step, &json!({}), &compiler).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].target, "a");
    }

    #[test]
    fn all_strategy_collects_every_match() {
        let compiler = JexlCompiler::new();
        let mut step = Step::new("gate");
        step.edges.push(Edge::to("a").when("true"));
        step.edges.push(Edge::to("b").when("true"));
        let matched = evaluate_edges(&step, &json!({}), &compiler).unwrap();
        assert_eq!(matched.len(), 2);
    }
}
