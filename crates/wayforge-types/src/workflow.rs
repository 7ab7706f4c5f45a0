//! The workflow definition IR: steps, edges, retry/catch/join configuration,
//! and input/output schemas.
//!
//! `Workflow` is immutable once constructed -- `Workflow::new` is the single
//! validated constructor; there is no setter that can leave a `Workflow` in
//! an invalid state afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The path label reserved for the root path of every execution. Rejected
/// as an edge label at workflow construction.
pub const MAIN_PATH: &str = "main";

// ---------------------------------------------------------------------------
// Edge matching / jitter enums
// ---------------------------------------------------------------------------

/// How a step's outgoing edges are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMatchingStrategy {
    /// Evaluate every edge; take all whose condition matches.
    #[default]
    All,
    /// Stop at the first edge whose condition matches.
    First,
}

/// Retry delay jitter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Jitter {
    /// Use the scheduled delay exactly.
    #[default]
    None,
    /// Draw the delay uniformly from `[0, scheduled]`.
    Full,
}

// ---------------------------------------------------------------------------
// Retry / catch / join configuration
// ---------------------------------------------------------------------------

/// One retry policy candidate for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Error-kind match tokens this policy applies to. Empty means `ALL`.
    #[serde(default)]
    pub error_equals: Vec<String>,
    /// Maximum number of retries after the initial attempt (>= 0).
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling on the scheduled delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier applied per retry attempt.
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    /// Jitter mode applied to the scheduled delay.
    #[serde(default)]
    pub jitter: Jitter,
    /// Optional per-attempt timeout, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_backoff_rate() -> f64 {
    2.0
}

impl RetryConfig {
    /// Base delay as a `Duration`.
    pub fn base_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.base_delay_ms)
    }

    /// Max delay ceiling as a `Duration`.
    pub fn max_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_delay_ms)
    }

    /// Per-attempt timeout, if configured.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// A catch handler: redirects a step whose retries are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchConfig {
    /// Error-kind match tokens this handler applies to. Empty means `ALL`.
    #[serde(default)]
    pub error_equals: Vec<String>,
    /// The step to redirect to.
    pub next: String,
    /// Optional variable name to store the structured `ErrorOutput` into.
    #[serde(default)]
    pub store: Option<String>,
}

/// Fan-in join configuration attached to a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Explicit set of source path ids. When unset, the default is all
    /// completed non-waiting sibling paths.
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    /// Minimum number of completed contributing paths required to resolve.
    /// When unset, defaults to `paths.len()` if `paths` is set, else 2.
    #[serde(default)]
    pub count: Option<usize>,
    /// Maps a source key (`"pathId"` or `"pathId.variableName"`) to a
    /// destination variable name (dot-path permitted) in the merged map.
    #[serde(default)]
    pub path_mappings: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Each iteration
// ---------------------------------------------------------------------------

/// An `items` source for `each` iteration: either a literal value or a
/// script expression string to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemsSource {
    /// A script expression (evaluated as `$(...)`, a whole-value script) or
    /// a plain string literal -- the step executor decides which by probing
    /// for `$(...)` wrapping, same rule as any other templated parameter.
    Expression(String),
    /// A literal value, iterated directly.
    Literal(Value),
}

/// `each` loop configuration on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EachConfig {
    /// The collection (or expression yielding one) to iterate.
    pub items: ItemsSource,
    /// The loop variable name written into path state per iteration.
    #[serde(default = "default_each_as")]
    pub r#as: String,
}

fn default_each_as() -> String {
    "item".to_string()
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// One outgoing edge from a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// The target step name.
    pub target: String,
    /// Optional boolean condition (script expression); an absent condition
    /// always matches.
    #[serde(default)]
    pub condition: Option<String>,
    /// Optional path label. A non-empty label names a freshly spawned
    /// sibling path unless it equals the current path's own label, in which
    /// case execution continues on the same path.
    #[serde(default)]
    pub path: Option<String>,
}

impl Edge {
    /// Construct an unconditional, unlabelled edge to `target`.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: None,
            path: None,
        }
    }

    /// Attach a condition expression.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Attach a path label.
    pub fn labelled(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique, non-empty step name.
    pub name: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Variable name the activity's return value is written to on success.
    #[serde(default)]
    pub store: Option<String>,
    /// Activity identifier resolved against the registry. Absent with no
    /// `each`/`join` makes this a pure decision step.
    #[serde(default)]
    pub activity: Option<String>,
    /// Parameters passed to the activity. Values may be template strings
    /// (`${...}`/`$(...)`) or plain scalars/collections.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Optional iteration over a collection.
    #[serde(default)]
    pub each: Option<EachConfig>,
    /// Outgoing edges, evaluated in order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Whether to take the first matching edge or all matching edges.
    #[serde(default)]
    pub edge_matching_strategy: EdgeMatchingStrategy,
    /// Retry policy candidates, tried in order against the first error seen.
    #[serde(default)]
    pub retry: Vec<RetryConfig>,
    /// Catch handlers tried in order against the final error.
    #[serde(default)]
    pub catch: Vec<CatchConfig>,
    /// Fan-in join configuration, if this step is a join point.
    #[serde(default)]
    pub join: Option<JoinConfig>,
}

impl Step {
    /// A minimal step with just a name -- useful for decision-only/join
    /// steps and as a builder starting point.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            store: None,
            activity: None,
            parameters: HashMap::new(),
            each: None,
            edges: Vec::new(),
            edge_matching_strategy: EdgeMatchingStrategy::default(),
            retry: Vec::new(),
            catch: Vec::new(),
            join: None,
        }
    }

    /// True iff this step has neither an activity, an `each`, nor a `join`
    /// -- i.e. it only evaluates outgoing edges.
    pub fn is_decision_only(&self) -> bool {
        self.activity.is_none() && self.each.is_none() && self.join.is_none()
    }
}

// ---------------------------------------------------------------------------
// Input / output schema
// ---------------------------------------------------------------------------

/// One declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// One declared workflow output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    /// Source variable name (dot-path permitted) to read from the source
    /// path's persisted variables.
    pub variable: String,
    /// Source path id; defaults to `"main"` when unset.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl OutputSpec {
    /// The path id this output reads from, defaulting to `"main"`.
    pub fn source_path(&self) -> &str {
        self.path.as_deref().unwrap_or(MAIN_PATH)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An immutable, validated workflow definition.
///
/// Construct via [`Workflow::new`]; there is no way to obtain a `Workflow`
/// that violates its structural invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Initial path-local variables for the main path.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// Errors surfaced synchronously from [`Workflow::new`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow name must not be empty")]
    EmptyName,
    #[error("workflow must have at least one step")]
    NoSteps,
    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),
    #[error("step '{step}' has an edge to undefined target '{target}'")]
    UndefinedEdgeTarget { step: String, target: String },
    #[error("step '{step}' has an edge to reserved path label '{MAIN_PATH}'")]
    ReservedPathLabel { step: String },
    #[error("catch handler on step '{step}' targets undefined step '{target}'")]
    UndefinedCatchTarget { step: String, target: String },
    #[error("output '{0}' has an empty variable name")]
    EmptyOutputVariable(String),
}

impl Workflow {
    /// Validate and construct a `Workflow`. The first step in `steps` is
    /// the start step.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Step>,
        inputs: Vec<InputSpec>,
        outputs: Vec<OutputSpec>,
        variables: HashMap<String, Value>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }

        let mut seen = std::collections::HashSet::new();
        for step in &steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStepName(step.name.clone()));
            }
        }

        for step in &steps {
            for edge in &step.edges {
                if !seen.contains(edge.target.as_str()) {
                    return Err(ValidationError::UndefinedEdgeTarget {
                        step: step.name.clone(),
                        target: edge.target.clone(),
                    });
                }
                if edge.path.as_deref() == Some(MAIN_PATH) {
                    return Err(ValidationError::ReservedPathLabel {
                        step: step.name.clone(),
                    });
                }
            }
            for catch in &step.catch {
                if !seen.contains(catch.next.as_str()) {
                    return Err(ValidationError::UndefinedCatchTarget {
                        step: step.name.clone(),
                        target: catch.next.clone(),
                    });
                }
            }
        }

        for output in &outputs {
            if output.variable.is_empty() {
                return Err(ValidationError::EmptyOutputVariable(output.name.clone()));
            }
        }

        Ok(Self {
            name,
            steps,
            inputs,
            outputs,
            variables,
        })
    }

    /// The start step: the first entry in `steps`.
    pub fn start_step(&self) -> &Step {
        &self.steps[0]
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}
