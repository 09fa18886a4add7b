//! Structural executors (spec §4.3, component C3): `if`, `switch`, `parallel`,
//! `loop`, `tryCatch`, `retry`, `rateLimit`. `merge` is the exception - its
//! per-branch dispatch and barrier handling lives directly in
//! [`crate::scheduler`], since a merge node is dispatched once per arriving
//! edge rather than once per readiness, which the uniform `NodeExecutor`
//! contract doesn't model.
//!
//! These executors resolve only the specific parameter leaves they need
//! (condition/when/retryOn expressions via `evaluateCondition`, `items` via
//! `resolve`) rather than going through the scheduler's generic
//! parameter-tree resolution - see the comment in
//! `scheduler::dispatch_normal` for why.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flow_workflow::value::Value;
use flow_workflow::{Connection, Node, NodeMap};
use flow_workflow::{HANDLE_BODY, HANDLE_CATCH, HANDLE_FALSE, HANDLE_TRUE, HANDLE_TRY};
use futures::future::join_all;

use crate::context::ExecutionContext;
use crate::error::{NodeError, NodeErrorKind};
use crate::executor::{NodeExecutor, NodeExecutorRegistry, NodeOutput};
use crate::expression::{self, Scope};
use crate::scheduler::{error_to_value, subgraph_from_handle};

pub fn register_all(registry: &mut NodeExecutorRegistry) {
    registry.register(std::sync::Arc::new(IfExecutor));
    registry.register(std::sync::Arc::new(SwitchExecutor));
    registry.register(std::sync::Arc::new(ParallelExecutor));
    registry.register(std::sync::Arc::new(LoopExecutor));
    registry.register(std::sync::Arc::new(TryCatchExecutor));
    registry.register(std::sync::Arc::new(RetryExecutor));
    registry.register(std::sync::Arc::new(RateLimitExecutor));
}

fn scope_for<'a>(input_value: &'a Value, nodes: &'a HashMap<String, Value>, vars: &'a HashMap<String, Value>) -> Scope<'a> {
    Scope {
        input: input_value,
        nodes,
        vars,
    }
}

pub struct IfExecutor;

#[async_trait]
impl NodeExecutor for IfExecutor {
    fn node_type(&self) -> &'static str {
        "if"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let input_value = Value::Object(input.clone());
        let nodes = ctx.node_outputs_snapshot();
        let vars = ctx.variables_snapshot();
        let scope = scope_for(&input_value, &nodes, &vars);

        let condition = node.parameters.get("condition").and_then(|v| v.as_str());
        let result = match condition {
            Some(expr) => match expression::evaluate_condition(expr, &scope) {
                Ok(b) => b,
                Err(e) => {
                    ctx.logger().warn(&node.id, format!("if condition error, treated as false: {e}"));
                    false
                }
            },
            None => false,
        };

        let mut out = input.clone();
        out.insert("conditionResult".to_string(), Value::Bool(result));
        out.insert(
            "branch".to_string(),
            Value::String(if result { "true" } else { "false" }.to_string()),
        );
        let handle = if result { HANDLE_TRUE } else { HANDLE_FALSE };
        Ok(NodeOutput::on(handle, out))
    }
}

/// No case matching and no `default` configured is not an error: the node
/// emits on a handle ("none") no real connection is expected to target, so
/// the dead branch simply never dispatches (spec §4.5 "dies out naturally").
const SWITCH_NONE_HANDLE: &str = "none";

pub struct SwitchExecutor;

#[async_trait]
impl NodeExecutor for SwitchExecutor {
    fn node_type(&self) -> &'static str {
        "switch"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let input_value = Value::Object(input.clone());
        let nodes = ctx.node_outputs_snapshot();
        let vars = ctx.variables_snapshot();
        let scope = scope_for(&input_value, &nodes, &vars);

        let cases = node.parameters.get("cases").and_then(|v| v.as_array());
        let mut matched: Option<String> = None;
        if let Some(cases) = cases {
            for case in cases {
                let when = case.get("when").and_then(|v| v.as_str());
                let handle = case.get("handle").and_then(|v| v.as_str());
                let (Some(when), Some(handle)) = (when, handle) else {
                    continue;
                };
                match expression::evaluate_condition(when, &scope) {
                    Ok(true) => {
                        matched = Some(handle.to_string());
                        break;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        ctx.logger()
                            .warn(&node.id, format!("switch case '{when}' error, skipped: {e}"));
                        continue;
                    }
                }
            }
        }
        let handle = matched
            .or_else(|| node.parameters.get("default").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| SWITCH_NONE_HANDLE.to_string());

        let mut out = input.clone();
        out.insert("branch".to_string(), Value::String(handle.clone()));
        Ok(NodeOutput::on(handle, out))
    }
}

/// Deserialized shape of one `parallel` inline branch.
#[derive(serde::Deserialize)]
struct InlineBranch {
    id: String,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
}

pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    fn node_type(&self) -> &'static str {
        "parallel"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        match node.parameters.get("branches") {
            // Fan-out: the scheduler's normal concurrent dispatch of every
            // outgoing edge already provides the concurrency (spec §4.3).
            Some(Value::Number(_)) => Ok(NodeOutput::main(input.clone())),
            Some(Value::Array(items)) if items.is_empty() => {
                // Empty inline-branch list: pass the input through unchanged
                // (spec §8 boundary behavior "`parallel` with empty
                // `branches` list -> passes input through with
                // `_branchCount=0`").
                let mut out = input.clone();
                out.insert("_branchCount".to_string(), Value::from(0));
                Ok(NodeOutput::main(out))
            }
            Some(Value::Array(items)) => {
                let mut branches = Vec::with_capacity(items.len());
                for item in items {
                    let branch: InlineBranch = serde_json::from_value(item.clone()).map_err(|e| {
                        NodeError::config(format!("parallel node '{}': invalid inline branch: {e}", node.id))
                    })?;
                    branches.push(branch);
                }
                let futures = branches.into_iter().map(|branch| {
                    let ctx = ctx.clone();
                    let input = input.clone();
                    async move {
                        let output = ctx
                            .scheduler()
                            .clone()
                            .run_subgraph(branch.nodes, branch.connections, input, &ctx)
                            .await?;
                        Ok::<(String, NodeMap), NodeError>((branch.id, output))
                    }
                });
                let results = join_all(futures).await;
                let mut out = NodeMap::new();
                for result in results {
                    let (branch_id, output) = result?;
                    out.insert(branch_id, Value::Object(output));
                }
                Ok(NodeOutput::main(out))
            }
            other => {
                let detail = match other {
                    Some(v) => format!("expected integer or array, got {}", type_name(v)),
                    None => "missing 'branches' parameter".to_string(),
                };
                let mut out = NodeMap::new();
                out.insert(
                    "error".to_string(),
                    Value::String(format!("Invalid branches configuration: {detail}")),
                );
                Ok(NodeOutput::main(out))
            }
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 10_000;

pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    fn node_type(&self) -> &'static str {
        "loop"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let input_value = Value::Object(input.clone());
        let nodes = ctx.node_outputs_snapshot();
        let vars = ctx.variables_snapshot();
        let scope = scope_for(&input_value, &nodes, &vars);

        let items_tree = node
            .parameters
            .get("items")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let resolved_items = expression::resolve(&items_tree, &scope)
            .map_err(|e| NodeError::config(format!("loop node '{}': items expression error: {e}", node.id)))?;
        let items = match resolved_items {
            Value::Array(items) => items,
            other => {
                return Err(NodeError::config(format!(
                    "loop node '{}': 'items' resolved to a non-array ({})",
                    node.id,
                    type_name(&other)
                )))
            }
        };

        let batch_size = node
            .parameters
            .get("batchSize")
            .and_then(|v| v.as_u64())
            .unwrap_or(1)
            .max(1) as usize;
        let parallel = node.parameters.get("parallel").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_iterations = node
            .parameters
            .get("maxIterations")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_LOOP_ITERATIONS);

        let batches: Vec<Vec<Value>> = items.chunks(batch_size).map(|c| c.to_vec()).collect();
        if batches.len() as u64 > max_iterations {
            return Err(NodeError::config(format!(
                "loop node '{}': {} iterations exceeds the cap of {}",
                node.id,
                batches.len(),
                max_iterations
            )));
        }

        let (body_nodes, body_connections) = subgraph_from_handle(&ctx.workflow, &node.id, HANDLE_BODY);

        let run_batch = |batch: Vec<Value>| {
            let ctx = ctx.clone();
            let body_nodes = body_nodes.clone();
            let body_connections = body_connections.clone();
            async move {
                let mut body_input = NodeMap::new();
                if batch.len() == 1 {
                    body_input.insert("item".to_string(), batch.into_iter().next().unwrap());
                } else {
                    body_input.insert("items".to_string(), Value::Array(batch));
                }
                ctx.scheduler()
                    .clone()
                    .run_subgraph(body_nodes, body_connections, body_input, &ctx)
                    .await
            }
        };

        let results: Vec<Result<NodeMap, NodeError>> = if parallel {
            join_all(batches.into_iter().map(run_batch)).await
        } else {
            let mut out = Vec::new();
            for batch in batches {
                let result = run_batch(batch).await;
                let is_err = result.is_err();
                out.push(result);
                if is_err {
                    break;
                }
            }
            out
        };

        let mut collected = Vec::with_capacity(results.len());
        for result in results {
            collected.push(Value::Object(result?));
        }

        let mut out = input.clone();
        out.insert("results".to_string(), Value::Array(collected));
        Ok(NodeOutput::main(out))
    }
}

pub struct TryCatchExecutor;

#[async_trait]
impl NodeExecutor for TryCatchExecutor {
    fn node_type(&self) -> &'static str {
        "tryCatch"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let (try_nodes, try_connections) = subgraph_from_handle(&ctx.workflow, &node.id, HANDLE_TRY);
        let try_result = ctx
            .scheduler()
            .clone()
            .run_subgraph(try_nodes, try_connections, input.clone(), ctx)
            .await;

        match try_result {
            Ok(output) => Ok(NodeOutput::main(output)),
            Err(err) => {
                let (catch_nodes, catch_connections) = subgraph_from_handle(&ctx.workflow, &node.id, HANDLE_CATCH);
                if catch_nodes.is_empty() {
                    return Err(err);
                }
                let mut catch_input = NodeMap::new();
                catch_input.insert("error".to_string(), error_to_value(&err));
                let output = ctx
                    .scheduler()
                    .clone()
                    .run_subgraph(catch_nodes, catch_connections, catch_input, ctx)
                    .await?;
                Ok(NodeOutput::main(output))
            }
        }
    }
}

pub struct RetryExecutor;

#[async_trait]
impl NodeExecutor for RetryExecutor {
    fn node_type(&self) -> &'static str {
        "retry"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let max_attempts = node
            .parameters
            .get("maxAttempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(1)
            .max(1);
        let backoff_exponential = node.parameters.get("backoff").and_then(|v| v.as_str()) == Some("exponential");
        let initial_delay_ms = node.parameters.get("initialDelayMs").and_then(|v| v.as_u64()).unwrap_or(0);
        let max_delay_ms = node.parameters.get("maxDelayMs").and_then(|v| v.as_u64()).unwrap_or(u64::MAX);
        let retry_on = node.parameters.get("retryOn").and_then(|v| v.as_str()).map(str::to_string);

        let (body_nodes, body_connections) = subgraph_from_handle(&ctx.workflow, &node.id, HANDLE_BODY);

        let mut attempt: u64 = 1;
        loop {
            let result = ctx
                .scheduler()
                .clone()
                .run_subgraph(body_nodes.clone(), body_connections.clone(), input.clone(), ctx)
                .await;

            let err = match result {
                Ok(output) => return Ok(NodeOutput::main(output)),
                Err(err) => err,
            };

            let exhausted = attempt >= max_attempts;
            let eligible_kind = matches!(err.kind, NodeErrorKind::Transient | NodeErrorKind::Timeout);
            let predicate_holds = match &retry_on {
                None => true,
                Some(expr) => {
                    let mut error_input = NodeMap::new();
                    error_input.insert("error".to_string(), error_to_value(&err));
                    let input_value = Value::Object(error_input);
                    let nodes = ctx.node_outputs_snapshot();
                    let vars = ctx.variables_snapshot();
                    let scope = scope_for(&input_value, &nodes, &vars);
                    expression::evaluate_condition(expr, &scope).unwrap_or(false)
                }
            };

            if exhausted || !eligible_kind || !predicate_holds {
                return Err(err);
            }

            let delay_ms = if backoff_exponential {
                initial_delay_ms.saturating_mul(1u64 << (attempt - 1).min(62))
            } else {
                initial_delay_ms
            }
            .min(max_delay_ms);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            attempt += 1;
        }
    }
}

pub struct RateLimitExecutor;

#[async_trait]
impl NodeExecutor for RateLimitExecutor {
    fn node_type(&self) -> &'static str {
        "rateLimit"
    }

    async fn execute(&self, node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let min_interval = if let Some(interval_ms) = node.parameters.get("interval").and_then(|v| v.as_u64()) {
            Duration::from_millis(interval_ms)
        } else if let Some(rps) = node.parameters.get("rps").and_then(|v| v.as_f64()) {
            if rps <= 0.0 {
                return Err(NodeError::config(format!("rateLimit node '{}': 'rps' must be > 0", node.id)));
            }
            Duration::from_secs_f64(1.0 / rps)
        } else {
            return Err(NodeError::config(format!(
                "rateLimit node '{}': requires 'rps' or 'interval'",
                node.id
            )));
        };

        ctx.rate_limit_acquire(&node.id, min_interval).await;
        Ok(NodeOutput::main(input.clone()))
    }
}
