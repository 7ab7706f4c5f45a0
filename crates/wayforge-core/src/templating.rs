//! Template interpolation (`${...}`) and whole-value script expressions
//! (`$(...)`) over JEXL. `Compiler`/`Script` are the seam a host
//! could swap for a different expression language; [`JexlCompiler`] is the
//! shipped reference implementation.

use std::sync::Arc;

use jexl_eval::Evaluator;
use serde_json::Value;

use crate::error::TemplateError;

/// A compiled script expression, ready to evaluate repeatedly against
/// different globals (once per `each` iteration, for instance).
pub trait Script: Send + Sync {
    fn evaluate(&self, globals: &Value) -> Result<Value, TemplateError>;
}

/// Compiles script expression source into a reusable [`Script`].
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Box<dyn Script>, TemplateError>;
}

/// The named transforms available to every script/condition expression:
/// `lower`, `upper`, `trim`, `split`, `contains`,
/// `startsWith`, `endsWith`, `length`.
fn build_evaluator() -> Evaluator<'static> {
    Evaluator::new()
        .with_transform("lower", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(s.to_lowercase()))
        })
        .with_transform("upper", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(s.to_uppercase()))
        })
        .with_transform("trim", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(s.trim().to_string()))
        })
        .with_transform("split", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            let sep = args.get(1).and_then(Value::as_str).unwrap_or(",");
            Ok(Value::Array(
                s.split(sep).map(|part| Value::String(part.to_string())).collect(),
            ))
        })
        .with_transform("contains", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            let needle = args.get(1).and_then(Value::as_str).unwrap_or_default();
            Ok(Value::Bool(s.contains(needle)))
        })
        .with_transform("startsWith", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            let prefix = args.get(1).and_then(Value::as_str).unwrap_or_default();
            Ok(Value::Bool(s.starts_with(prefix)))
        })
        .with_transform("endsWith", |args| {
            let s = args.first().and_then(Value::as_str).unwrap_or_default();
            let suffix = args.get(1).and_then(Value::as_str).unwrap_or_default();
            Ok(Value::Bool(s.ends_with(suffix)))
        })
        .with_transform("length", |args| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            };
            Ok(Value::Number(len.into()))
        })
}

/// JEXL-backed [`Compiler`]. Cheap to clone (wraps an `Arc`); build one per
/// engine and share it across every path task.
#[derive(Clone)]
pub struct JexlCompiler {
    evaluator: Arc<Evaluator<'static>>,
}

impl JexlCompiler {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(build_evaluator()),
        }
    }
}

impl Default for JexlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

struct JexlScript {
    evaluator: Arc<Evaluator<'static>>,
    source: String,
}

impl Script for JexlScript {
    fn evaluate(&self, globals: &Value) -> Result<Value, TemplateError> {
        self.evaluator
            .eval_in_context(&self.source, globals)
            .map_err(|e| TemplateError::Evaluate {
                expression: self.source.clone(),
                cause: e.to_string(),
            })
    }
}

impl Compiler for JexlCompiler {
    fn compile(&self, source: &str) -> Result<Box<dyn Script>, TemplateError> {
        if source.trim().is_empty() {
            return Err(TemplateError::EmptyExpression);
        }
        Ok(Box::new(JexlScript {
            evaluator: self.evaluator.clone(),
            source: source.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// `${...}` / `$(...)` parsing layer
// ---------------------------------------------------------------------------

enum Segment<'a> {
    Literal(&'a str),
    Expr(&'a str),
}

/// Split `text` on `${...}` boundaries, tracking brace depth so a nested
/// `{` inside the expression doesn't end the segment early. Unbalanced
/// braces are a compile error.
fn parse_segments(text: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if literal_start < i {
                segments.push(Segment::Literal(&text[literal_start..i]));
            }
            let expr_start = i + 2;
            let mut depth = 1;
            let mut j = expr_start;
            while j < bytes.len() {
                match bytes[j] {
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            if depth != 0 {
                return Err(TemplateError::UnbalancedBrace(text.to_string()));
            }
            segments.push(Segment::Expr(&text[expr_start..j]));
            i = j + 1;
            literal_start = i;
        } else {
            i += 1;
        }
    }
    if literal_start < text.len() {
        segments.push(Segment::Literal(&text[literal_start..]));
    }
    Ok(segments)
}

/// Detect whether `text` is a single `$(...)` wrapping its entire span (as
/// opposed to a `$(...)` appearing only as part of a larger string). Returns
/// the inner expression source when it does.
fn whole_script_expr(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() < 3 || bytes[0] != b'$' || bytes[1] != b'(' || bytes[bytes.len() - 1] != b')' {
        return None;
    }
    let inner_start = 2;
    let inner_end = bytes.len() - 1;
    let mut depth = 1;
    for (offset, &b) in bytes[inner_start..inner_end].iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    // Closes before the final char: the `)` at text's end
                    // isn't this paren's match, so it isn't a whole-string
                    // wrap (e.g. "$(a)-$(b)").
                    let closes_at = inner_start + offset;
                    if closes_at != inner_end - 1 {
                        return None;
                    }
                }
            }
            _ => {}
        }
    }
    if depth == 1 {
        Some(&text[inner_start..inner_end])
    } else {
        None
    }
}

fn value_to_interpolated_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Render a template string against `globals`. A `$(...)`-wrapped whole
/// string evaluates as a script and preserves the native JSON type; any
/// other string is interpolated segment by segment and always yields a
/// `Value::String`. A string with no `${...}`/`$(...)` passes through
/// verbatim.
pub fn render_template(
    compiler: &dyn Compiler,
    text: &str,
    globals: &Value,
) -> Result<Value, TemplateError> {
    if let Some(expr) = whole_script_expr(text) {
        return compiler.compile(expr)?.evaluate(globals);
    }

    let segments = parse_segments(text)?;
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Expr(expr) => {
                let value = compiler.compile(expr)?.evaluate(globals)?;
                out.push_str(&value_to_interpolated_string(&value));
            }
        }
    }
    Ok(Value::String(out))
}

/// Recursively template every string leaf of a JSON value (step parameters);
/// arrays and objects recurse, non-string scalars pass through untouched.
pub fn template_value(
    compiler: &dyn Compiler,
    value: &Value,
    globals: &Value,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => render_template(compiler, s, globals),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(template_value(compiler, item, globals)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), template_value(compiler, item, globals)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// JS-like truthiness coercion used for condition evaluation: booleans pass
/// through, `null` is false, numbers are false only at zero, strings are
/// false only when empty, arrays and objects are always truthy.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate an edge condition: the literals `true`/
/// `false` short-circuit without invoking the compiler; anything else is a
/// script expression whose result is coerced to bool.
pub fn evaluate_condition(
    compiler: &dyn Compiler,
    condition: &str,
    globals: &Value,
) -> Result<bool, TemplateError> {
    match condition.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        expr => {
            let value = compiler.compile(expr)?.evaluate(globals)?;
            Ok(value_to_bool(&value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_string_passes_through_verbatim() {
        let compiler = JexlCompiler::new();
        let result = render_template(&compiler, "hello world", &json!({})).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn interpolates_a_single_segment() {
        let compiler = JexlCompiler::new();
        let globals = json!({"state": {"name": "ada"}});
        let result = render_template(&compiler, "hi ${state.name}!", &globals).unwrap();
        assert_eq!(result, json!("hi ada!"));
    }

    #[test]
    fn whole_script_preserves_native_type() {
        let compiler = JexlCompiler::new();
        let globals = json!({"state": {"count": 3}});
        let result = render_template(&compiler, "$(state.count + 1)", &globals).unwrap();
        assert_eq!(result, json!(4));
    }

    #[test]
    fn dollar_paren_not_spanning_whole_string_interpolates_as_text() {
        let compiler = JexlCompiler::new();
        let globals = json!({"state": {"a": 1, "b": 2}});
        let result = render_template(&compiler, "$(state.a)-$(state.b)", &globals).unwrap();
        assert_eq!(result, json!("1-2"));
    }

    #[test]
    fn unbalanced_brace_is_a_compile_error() {
        let compiler = JexlCompiler::new();
        let err = render_template(&compiler, "hi ${state.name", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::UnbalancedBrace(_)));
    }

    #[test]
    fn transforms_lower_upper_and_length() {
        let compiler = JexlCompiler::new();
        let globals = json!({"state": {"s": "Hello"}});
        assert_eq!(
            render_template(&compiler, "$(state.s|lower)", &globals).unwrap(),
            json!("hello")
        );
        assert_eq!(
            render_template(&compiler, "$(state.s|upper)", &globals).unwrap(),
            json!("HELLO")
        );
        assert_eq!(
            render_template(&compiler, "$(state.s|length)", &globals).unwrap(),
            json!(5)
        );
    }

    #[test]
    fn condition_literals_short_circuit() {
        let compiler = JexlCompiler::new();
        assert!(evaluate_condition(&compiler, "true", &json!({})).unwrap());
        assert!(!evaluate_condition(&compiler, "false", &json!({})).unwrap());
    }

    #[test]
    fn condition_coerces_truthiness_js_style() {
        assert!(value_to_bool(&json!("non-empty")));
        assert!(!value_to_bool(&json!("")));
        assert!(!value_to_bool(&json!(0)));
        assert!(value_to_bool(&json!(1)));
        assert!(!value_to_bool(&json!(null)));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!({})));
    }

    #[test]
    fn template_value_recurses_through_arrays_and_objects() {
        let compiler = JexlCompiler::new();
        let globals = json!({"state": {"name": "ada"}});
        let params = json!({"greeting": "hi ${state.name}", "tags": ["x", "${state.name}"], "count": 3});
        let result = template_value(&compiler, &params, &globals).unwrap();
        assert_eq!(result["greeting"], json!("hi ada"));
        assert_eq!(result["tags"][1], json!("ada"));
        assert_eq!(result["count"], json!(3));
    }
}
