//! Evaluation of parsed expression ASTs against a [`Scope`].

use serde_json::Value as Json;

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{ExpressionError, ExpressionResult, Scope};
use flow_workflow::value::{get_path, truthy};

pub fn eval(expr: &Expr, scope: &Scope) -> ExpressionResult<Json> {
    match expr {
        Expr::Null => Ok(Json::Null),
        Expr::Bool(b) => Ok(Json::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::json!(n)),
        Expr::Str(s) => Ok(Json::String(s.clone())),
        Expr::Ref(path) => Ok(resolve_ref(path, scope)),
        Expr::Unary(op, operand) => eval_unary(*op, operand, scope),
        Expr::Binary(left, op, right) => eval_binary(left, *op, right, scope),
    }
}

/// Resolve a `$`-reference (already split on `.`) against the scope.
/// Missing data resolves to `null`, never an error (spec §4.1).
fn resolve_ref(path: &[String], scope: &Scope) -> Json {
    let Some((head, rest)) = path.split_first() else {
        return Json::Null;
    };
    let rest_path = rest.join(".");
    match head.as_str() {
        "input" => get_path(scope.input, &rest_path),
        "nodes" => {
            let Some((node_id, deeper)) = rest.split_first() else {
                return Json::Null;
            };
            match scope.nodes.get(node_id.as_str()) {
                Some(output) => get_path(output, &deeper.join(".")),
                None => Json::Null,
            }
        }
        "vars" => {
            let Some((name, deeper)) = rest.split_first() else {
                return Json::Null;
            };
            match scope.vars.get(name.as_str()) {
                Some(v) => get_path(v, &deeper.join(".")),
                None => Json::Null,
            }
        }
        _ => Json::Null,
    }
}

fn eval_unary(op: UnaryOp, operand: &Expr, scope: &Scope) -> ExpressionResult<Json> {
    let v = eval(operand, scope)?;
    match op {
        UnaryOp::Not => Ok(Json::Bool(!truthy(&v))),
        UnaryOp::Neg => match as_number(&v) {
            Some(n) => Ok(serde_json::json!(-n)),
            None => Err(ExpressionError::Type(format!(
                "cannot negate non-numeric value {v}"
            ))),
        },
    }
}

fn eval_binary(left: &Expr, op: BinaryOp, right: &Expr, scope: &Scope) -> ExpressionResult<Json> {
    // Short-circuit logical operators.
    if matches!(op, BinaryOp::And) {
        let l = eval(left, scope)?;
        if !truthy(&l) {
            return Ok(Json::Bool(false));
        }
        let r = eval(right, scope)?;
        return Ok(Json::Bool(truthy(&r)));
    }
    if matches!(op, BinaryOp::Or) {
        let l = eval(left, scope)?;
        if truthy(&l) {
            return Ok(Json::Bool(true));
        }
        let r = eval(right, scope)?;
        return Ok(Json::Bool(truthy(&r)));
    }

    let l = eval(left, scope)?;
    let r = eval(right, scope)?;

    match op {
        BinaryOp::Eq => Ok(Json::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Json::Bool(!values_equal(&l, &r))),
        BinaryOp::Contains => Ok(Json::Bool(contains(&l, &r))),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            // String concatenation for `+` when either side is a string.
            if matches!(op, BinaryOp::Add) && (l.is_string() || r.is_string()) {
                return Ok(Json::String(format!(
                    "{}{}",
                    flow_workflow::value::stringify(&l),
                    flow_workflow::value::stringify(&r)
                )));
            }
            let (ln, rn) = (
                as_number(&l).ok_or_else(|| ExpressionError::Type(format!("not a number: {l}")))?,
                as_number(&r).ok_or_else(|| ExpressionError::Type(format!("not a number: {r}")))?,
            );
            let result = match op {
                BinaryOp::Add => ln + rn,
                BinaryOp::Sub => ln - rn,
                BinaryOp::Mul => ln * rn,
                BinaryOp::Div => ln / rn,
                BinaryOp::Mod => ln % rn,
                _ => unreachable!(),
            };
            Ok(serde_json::json!(result))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&l, &r)?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Json::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn as_number(v: &Json) -> Option<f64> {
    match v {
        Json::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Equality: `null == null` holds; `null` equals nothing else (spec §8).
fn values_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Null, Json::Null) => true,
        (Json::Null, _) | (_, Json::Null) => false,
        _ => a == b,
    }
}

fn contains(haystack: &Json, needle: &Json) -> bool {
    match haystack {
        Json::String(s) => match needle {
            Json::String(n) => s.contains(n.as_str()),
            _ => s.contains(&flow_workflow::value::stringify(needle)),
        },
        Json::Array(arr) => arr.iter().any(|v| values_equal(v, needle)),
        _ => false,
    }
}

fn compare(a: &Json, b: &Json) -> ExpressionResult<std::cmp::Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x
            .partial_cmp(&y)
            .ok_or_else(|| ExpressionError::Type("NaN comparison".into())),
        _ => match (a, b) {
            (Json::String(x), Json::String(y)) => Ok(x.cmp(y)),
            _ => Err(ExpressionError::Type(format!(
                "cannot compare {a} and {b}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use std::collections::HashMap;

    fn scope<'a>(input: &'a Json, nodes: &'a HashMap<String, Json>, vars: &'a HashMap<String, Json>) -> Scope<'a> {
        Scope { input, nodes, vars }
    }

    #[test]
    fn missing_input_resolves_null_and_compares_false() {
        let input = serde_json::json!({});
        let nodes = HashMap::new();
        let vars = HashMap::new();
        let s = scope(&input, &nodes, &vars);
        let expr = parse("$input.x == 'x'").unwrap();
        assert_eq!(eval(&expr, &s).unwrap(), Json::Bool(false));
        let expr_null = parse("$input.x == null").unwrap();
        assert_eq!(eval(&expr_null, &s).unwrap(), Json::Bool(true));
    }

    #[test]
    fn arithmetic_and_comparison() {
        let input = serde_json::json!({"count": 15});
        let nodes = HashMap::new();
        let vars = HashMap::new();
        let s = scope(&input, &nodes, &vars);
        let expr = parse("$input.count > 10").unwrap();
        assert_eq!(eval(&expr, &s).unwrap(), Json::Bool(true));
    }
}
