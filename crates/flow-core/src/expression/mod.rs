//! `ExpressionResolver` (spec §4.1, component C1): renders templated
//! strings and resolves typed references against a live execution scope.

pub mod evaluator;
pub mod parser;

use std::collections::HashMap;

use flow_workflow::value::{stringify, truthy, Value};
use parser::{parse, parse_template, TemplatePart};
use thiserror::Error;

/// Syntax-level failures only; missing data is never an error here (spec
/// §4.1 "Fails with `ExpressionError` only for genuine syntax errors").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("type error: {0}")]
    Type(String),
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// The scope templates and references are resolved against: `$input` binds
/// the node's computed input, `$nodes` binds recorded upstream outputs by
/// node id, `$vars` binds workflow variables (spec §4.1, §4.5 step 5).
pub struct Scope<'a> {
    pub input: &'a Value,
    pub nodes: &'a HashMap<String, Value>,
    pub vars: &'a HashMap<String, Value>,
}

/// A string that is exactly one bare `$...` reference with no surrounding
/// text (`$input.count`, not `"n={{ $input.count }}"`).
fn as_bare_ref(s: &str) -> Option<Vec<String>> {
    let s = s.trim();
    let rest = s.strip_prefix('$')?;
    if rest.is_empty() || rest.contains("{{") {
        return None;
    }
    Some(rest.split('.').map(String::from).collect())
}

/// Resolve a single string leaf. A bare `$ref` preserves the referenced
/// value's type; a string containing exactly one `{{ expr }}` template and
/// no other text also preserves the expression's value type; anything else
/// concatenates stringified parts (spec §4.1 "A template resolving to a
/// non-string value, when embedded in a larger string, is stringified").
fn resolve_string(s: &str, scope: &Scope) -> ExpressionResult<Value> {
    if let Some(path) = as_bare_ref(s) {
        return Ok(evaluator::eval(&parser::Expr::Ref(path), scope)?);
    }
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }
    let parts = parse_template(s)?;
    if let [TemplatePart::Expr(expr)] = parts.as_slice() {
        return evaluator::eval(expr, scope);
    }
    let mut out = String::new();
    for part in &parts {
        match part {
            TemplatePart::Literal(lit) => out.push_str(lit),
            TemplatePart::Expr(expr) => {
                let v = evaluator::eval(expr, scope)?;
                out.push_str(&stringify(&v));
            }
        }
    }
    Ok(Value::String(out))
}

/// `resolve(paramTree, context) -> paramTree'`: replaces every
/// template/reference leaf, preserving the tree's array/object structure.
pub fn resolve(tree: &Value, scope: &Scope) -> ExpressionResult<Value> {
    match tree {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// `evaluateCondition(exprString, context) -> bool`, the distinct entry
/// point used by `if`, retry `until`, etc. An empty string is deterministic
/// falsy (spec §8).
pub fn evaluate_condition(expr: &str, scope: &Scope) -> ExpressionResult<bool> {
    let rendered = render_condition(expr, scope)?;
    let ast = parse(&rendered)?;
    let value = evaluator::eval(&ast, scope)?;
    Ok(truthy(&value))
}

/// Render any `{{ ... }}` template segments of a condition string into their
/// stringified value before parsing, so a condition that mixes a template
/// substitution with literal expression syntax (`"{{ $input.count }} > 10"`)
/// re-parses as a plain expression.
fn render_condition(expr: &str, scope: &Scope) -> ExpressionResult<String> {
    if !expr.contains("{{") {
        return Ok(expr.to_string());
    }
    let parts = parse_template(expr)?;
    let mut out = String::new();
    for part in &parts {
        match part {
            TemplatePart::Literal(lit) => out.push_str(lit),
            TemplatePart::Expr(inner) => out.push_str(&stringify(&evaluator::eval(inner, scope)?)),
        }
    }
    Ok(out)
}
