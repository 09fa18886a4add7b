//! The concurrent DAG scheduler (spec §4.5, component C5) - the hard part.
//!
//! `Scheduler` drives one workflow (or one structural node's wrapped
//! subgraph) to completion: readiness-based dispatch over a bounded worker
//! pool, input composition, `merge`'s per-branch dispatch, failure
//! propagation, and terminal output assembly. Structural executors
//! (`crate::structural`) call back into [`Scheduler::run_subgraph`] through
//! [`crate::context::ExecutionContext::scheduler`] to run their wrapped
//! subgraphs under the same pool (spec §9 Open Questions: `loop.parallel`
//! shares the global concurrency bound).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flow_workflow::value::{shallow_overlay, strip_reserved, Value};
use flow_workflow::{Connection, Node, NodeExecutionRecord, NodeMap, NodeStatus, Workflow, OnError};
use flow_workflow::{HANDLE_BODY, HANDLE_CATCH, HANDLE_ERROR, HANDLE_MAIN, HANDLE_TRY};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Semaphore;

use crate::barrier::{BarrierOutcome, MergeMode, MergeSpec};
use crate::context::ExecutionContext;
use crate::error::{NodeError, NodeErrorKind};
use crate::executor::NodeExecutorRegistry;
use crate::expression::{self, Scope};

/// Outcome of a completed (sub)graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GraphOutcome {
    pub status: GraphStatus,
    pub output: NodeMap,
    pub error: Option<NodeError>,
}

/// The worker pool plus the (stateless, re-entrant) dispatch logic. One
/// `Scheduler` is shared by a whole execution, including every nested
/// subgraph run it spawns.
pub struct Scheduler {
    registry: Arc<NodeExecutorRegistry>,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(registry: Arc<NodeExecutorRegistry>, concurrency: usize) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<NodeExecutorRegistry> {
        &self.registry
    }

    /// Entry point for a whole execution (spec §4.5 steps 1-7). The trigger
    /// is seeded directly (step 2) and excluded from normal dispatch; every
    /// other node reachable from it is run through [`Self::run_graph`] with
    /// global mirroring on, so `$nodes.X` and the public `getNodeOutput` API
    /// see every node's result.
    pub async fn run_workflow(&self, ctx: &ExecutionContext, trigger: &Node) -> GraphOutcome {
        ctx.record_node_output(&trigger.id, HANDLE_MAIN, ctx.initial_input.clone());
        begin_record(ctx, &trigger.id);
        let mut rec = NodeExecutionRecord::started(&trigger.id, &trigger.name, &trigger.node_type, NodeMap::new());
        rec.finish_success(ctx.initial_input.clone());
        finish_record(ctx, rec);

        let reachable = ctx.workflow.reachable_from(&trigger.id);
        let nodes: Vec<Node> = ctx
            .workflow
            .nodes
            .iter()
            .filter(|n| n.id != trigger.id && reachable.contains(&n.id))
            .cloned()
            .collect();
        let connections: Vec<Connection> = ctx
            .workflow
            .connections
            .iter()
            .filter(|c| reachable.contains(&c.source_node_id) && reachable.contains(&c.target_node_id))
            .cloned()
            .collect();

        self.run_graph(nodes, connections, ctx.clone(), None, true).await
    }

    /// Entry point for a structural node's wrapped subgraph (`parallel`
    /// inline branch, `loop` body, `tryCatch` try/catch, `retry` body).
    /// Root nodes (no incoming edge within `connections`) receive `input`
    /// directly rather than being seeded as already-produced output, so they
    /// still run through their executor. Node outputs from this run are
    /// local to the call (never mirrored into the execution-wide registry),
    /// so repeated invocations - one per loop iteration, one per retry
    /// attempt - never collide on `recordNodeOutput`'s first-writer-wins
    /// rule.
    pub async fn run_subgraph(
        &self,
        nodes: Vec<Node>,
        connections: Vec<Connection>,
        input: NodeMap,
        ctx: &ExecutionContext,
    ) -> Result<NodeMap, NodeError> {
        let outcome = self.run_graph(nodes, connections, ctx.clone(), Some(input), false).await;
        match outcome.status {
            GraphStatus::Success => Ok(outcome.output),
            GraphStatus::Cancelled => Err(outcome
                .error
                .unwrap_or_else(|| NodeError::cancelled("subgraph cancelled"))),
            GraphStatus::Failed => Err(outcome
                .error
                .unwrap_or_else(|| NodeError::permanent("subgraph failed"))),
        }
    }

    async fn run_graph(
        &self,
        nodes: Vec<Node>,
        connections: Vec<Connection>,
        ctx: ExecutionContext,
        default_input_for_roots: Option<NodeMap>,
        mirror: bool,
    ) -> GraphOutcome {
        let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let node_by_id: HashMap<String, Arc<Node>> =
            nodes.into_iter().map(|n| (n.id.clone(), Arc::new(n))).collect();
        let connections = Arc::new(connections);
        let local_outputs: Arc<DashMap<String, (String, NodeMap)>> = Arc::new(DashMap::new());
        let dispatched: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let merge_dispatched: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());

        let mut running: FuturesUnordered<tokio::task::JoinHandle<DispatchResult>> = FuturesUnordered::new();
        let mut failure: Option<NodeError> = None;
        let mut any_cancelled = false;

        loop {
            if failure.is_none() && !ctx.is_cancelled() {
                for (id, node) in node_by_id.iter() {
                    if node.node_type == "merge" {
                        for conn in incoming(&connections, id) {
                            if merge_dispatched.contains_key(&conn.id) {
                                continue;
                            }
                            let Some((handle, data)) = lookup(&local_outputs, &ctx, &conn.source_node_id) else {
                                continue;
                            };
                            if handle != conn.source_handle_id {
                                continue;
                            }
                            merge_dispatched.insert(conn.id.clone(), ());
                            if has_stop(&data) {
                                continue; // dead branch, never arrives at the barrier
                            }
                            let payload = strip_reserved(&data);
                            running.push(tokio::spawn(dispatch_node(
                                node.clone(),
                                DispatchKind::MergeArrival {
                                    connection_id: conn.id.clone(),
                                    payload,
                                },
                                ctx.clone(),
                                self.registry.clone(),
                                self.semaphore.clone(),
                                connections.clone(),
                            )));
                        }
                        continue;
                    }

                    if dispatched.contains_key(id) {
                        continue;
                    }
                    let incoming_conns = incoming(&connections, id);
                    if incoming_conns.is_empty() {
                        let Some(default_input) = &default_input_for_roots else {
                            continue;
                        };
                        dispatched.insert(id.clone(), ());
                        running.push(tokio::spawn(dispatch_node(
                            node.clone(),
                            DispatchKind::Normal {
                                input: default_input.clone(),
                            },
                            ctx.clone(),
                            self.registry.clone(),
                            self.semaphore.clone(),
                            connections.clone(),
                        )));
                        continue;
                    }
                    let mut composed = NodeMap::new();
                    let mut ready = true;
                    for conn in &incoming_conns {
                        match lookup(&local_outputs, &ctx, &conn.source_node_id) {
                            Some((handle, data)) if handle == conn.source_handle_id && !has_stop(&data) => {
                                composed = shallow_overlay(&composed, &strip_reserved(&data));
                            }
                            _ => {
                                ready = false;
                                break;
                            }
                        }
                    }
                    if ready {
                        dispatched.insert(id.clone(), ());
                        running.push(tokio::spawn(dispatch_node(
                            node.clone(),
                            DispatchKind::Normal { input: composed },
                            ctx.clone(),
                            self.registry.clone(),
                            self.semaphore.clone(),
                            connections.clone(),
                        )));
                    }
                }
            }

            if running.is_empty() {
                break;
            }

            match running.next().await {
                None => break,
                Some(Err(_join_err)) => {
                    if failure.is_none() {
                        failure = Some(NodeError::permanent("worker task terminated unexpectedly"));
                    }
                }
                Some(Ok(result)) => {
                    if result.cancelled {
                        any_cancelled = true;
                    }
                    if let Some(err) = result.fatal_error {
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                    if let Some((handle, data)) = result.write {
                        let is_merge = node_by_id
                            .get(&result.node_id)
                            .map(|n| n.node_type == "merge")
                            .unwrap_or(false);
                        if mirror || is_merge {
                            ctx.record_node_output(&result.node_id, &handle, data.clone());
                        }
                        local_outputs.insert(result.node_id.clone(), (handle, data));
                    }
                }
            }
        }

        let status = if ctx.is_cancelled() || any_cancelled {
            GraphStatus::Cancelled
        } else if failure.is_some() {
            GraphStatus::Failed
        } else {
            GraphStatus::Success
        };

        let mut output = NodeMap::new();
        for id in &order {
            // A structural node's `body`/`try`/`catch` edges are consumed
            // entirely by its own internal `run_subgraph` call, never by
            // normal dispatch - they don't disqualify the node from being
            // this (sub)graph's leaf the way a `main`/`true`/`false`/`error`
            // edge does.
            if connections
                .iter()
                .any(|c| &c.source_node_id == id && !is_internal_handle(&c.source_handle_id))
            {
                continue; // not a leaf within this (sub)graph
            }
            if let Some((_, data)) = lookup(&local_outputs, &ctx, id) {
                output = shallow_overlay(&output, &data);
            }
        }

        GraphOutcome {
            status,
            output,
            error: failure,
        }
    }
}

/// Extract the subgraph reachable from `node_id`'s `handle` output, stopping
/// before any edge that would re-enter `node_id` itself (the back-edge that
/// makes a `loop` node's own cycle legal, spec §4.3 `loop` / §9 "Graph
/// cycles"). Used by `loop` (body), `tryCatch` (try/catch), and `retry`
/// (body) to pull their wrapped subgraph out of the workflow's flat
/// node/connection lists.
pub(crate) fn subgraph_from_handle(workflow: &Workflow, node_id: &str, handle: &str) -> (Vec<Node>, Vec<Connection>) {
    let mut ids: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for c in workflow.outgoing(node_id, handle) {
        if ids.insert(c.target_node_id.clone()) {
            queue.push_back(c.target_node_id.clone());
        }
    }
    while let Some(id) = queue.pop_front() {
        for c in workflow.outgoing_all(&id) {
            if c.target_node_id == node_id {
                continue;
            }
            if ids.insert(c.target_node_id.clone()) {
                queue.push_back(c.target_node_id.clone());
            }
        }
    }
    let nodes: Vec<Node> = workflow.nodes.iter().filter(|n| ids.contains(&n.id)).cloned().collect();
    let connections: Vec<Connection> = workflow
        .connections
        .iter()
        .filter(|c| ids.contains(&c.source_node_id) && ids.contains(&c.target_node_id))
        .cloned()
        .collect();
    (nodes, connections)
}

fn incoming<'a>(connections: &'a [Connection], node_id: &str) -> Vec<&'a Connection> {
    connections.iter().filter(|c| c.target_node_id == node_id).collect()
}

/// Handles a structural node only ever emits for its own internal
/// `run_subgraph` call (never through normal readiness-based dispatch).
fn is_internal_handle(handle: &str) -> bool {
    matches!(handle, HANDLE_BODY | HANDLE_TRY | HANDLE_CATCH)
}

/// Starts the dev-mode inspector's timing entry for a node dispatch. A
/// no-op when the inspector isn't attached (spec §4.7).
fn begin_record(ctx: &ExecutionContext, node_id: &str) {
    if let Some(inspector) = ctx.inspector() {
        inspector.start_node(node_id);
    }
}

/// Closes the inspector's timing entry and appends the execution record in
/// one place, so every dispatch return path keeps both in sync.
fn finish_record(ctx: &ExecutionContext, rec: NodeExecutionRecord) {
    if let Some(inspector) = ctx.inspector() {
        let success = matches!(rec.status, NodeStatus::Success);
        inspector.finish_node(&rec.node_id, success, rec.error.clone());
    }
    ctx.append_node_execution(rec);
}

fn has_stop(data: &NodeMap) -> bool {
    matches!(data.get("_stopExecution"), Some(Value::Bool(true)))
}

/// Read an upstream output, preferring this run's local store (subgraph
/// nodes) and falling back to the execution-wide registry (trigger, and any
/// `merge` node, which always writes globally since its `Barrier` is keyed
/// execution-wide regardless of nesting).
fn lookup(
    local: &DashMap<String, (String, NodeMap)>,
    ctx: &ExecutionContext,
    id: &str,
) -> Option<(String, NodeMap)> {
    if let Some(entry) = local.get(id) {
        return Some(entry.value().clone());
    }
    ctx.get_node_output_handle(id)
}

enum DispatchKind {
    Normal { input: NodeMap },
    MergeArrival { connection_id: String, payload: NodeMap },
}

struct DispatchResult {
    node_id: String,
    write: Option<(String, NodeMap)>,
    fatal_error: Option<NodeError>,
    cancelled: bool,
}

async fn dispatch_node(
    node: Arc<Node>,
    kind: DispatchKind,
    ctx: ExecutionContext,
    registry: Arc<NodeExecutorRegistry>,
    semaphore: Arc<Semaphore>,
    connections: Arc<Vec<Connection>>,
) -> DispatchResult {
    match kind {
        DispatchKind::Normal { input } => dispatch_normal(node, input, ctx, registry, semaphore, connections).await,
        DispatchKind::MergeArrival { connection_id, payload } => {
            dispatch_merge_arrival(node, connection_id, payload, ctx).await
        }
    }
}

async fn dispatch_normal(
    node: Arc<Node>,
    input: NodeMap,
    ctx: ExecutionContext,
    registry: Arc<NodeExecutorRegistry>,
    semaphore: Arc<Semaphore>,
    connections: Arc<Vec<Connection>>,
) -> DispatchResult {
    ctx.await_step().await;

    if ctx.is_cancelled() {
        let mut rec = NodeExecutionRecord::started(&node.id, &node.name, &node.node_type, input);
        rec.finish_error(NodeStatus::Cancelled, "execution cancelled".to_string());
        finish_record(&ctx, rec);
        return DispatchResult {
            node_id: node.id.clone(),
            write: None,
            fatal_error: None,
            cancelled: true,
        };
    }

    let mut rec = NodeExecutionRecord::started(&node.id, &node.name, &node.node_type, input.clone());

    // Disabled nodes are transparently skipped: output = merged input
    // unchanged (spec §4.5 step 3, testable property 7).
    if node.disabled {
        rec.finish_success(input.clone());
        finish_record(&ctx, rec);
        return DispatchResult {
            node_id: node.id.clone(),
            write: Some((HANDLE_MAIN.to_string(), input)),
            fatal_error: None,
            cancelled: false,
        };
    }

    // Structural nodes (`if`, `switch`, `loop`, `tryCatch`, `retry`,
    // `parallel`, `rateLimit`) have bespoke parameter contracts - raw
    // predicate expressions (`condition`, `when`, `retryOn`) evaluated via
    // `evaluateCondition` rather than `resolve`, and in `parallel`'s inline
    // case literal sub-node parameter trees that must not be resolved
    // against *this* node's scope at all. So only non-structural nodes go
    // through the generic parameter-tree resolution; structural executors
    // resolve exactly the leaves they need themselves (spec §4.1, §4.3).
    let resolved_node = if node.is_structural() {
        node.as_ref().clone()
    } else {
        match resolve_node(&node, &input, &ctx) {
            Ok(n) => n,
            Err(e) => {
                let msg = format!("expression error: {e}");
                rec.finish_error(NodeStatus::Failed, msg.clone());
                finish_record(&ctx, rec);
                return DispatchResult {
                    node_id: node.id.clone(),
                    write: None,
                    fatal_error: Some(NodeError::permanent(msg)),
                    cancelled: false,
                };
            }
        }
    };

    let _permit = semaphore.acquire_owned().await.ok();
    let outcome = match registry.get(&node.node_type) {
        Some(executor) => executor.execute(&resolved_node, &input, &ctx).await,
        None => Err(NodeError::config(format!(
            "no executor registered for node type '{}'",
            node.node_type
        ))),
    };
    drop(_permit);

    match outcome {
        Ok(output) => {
            rec.finish_success(output.data.clone());
            finish_record(&ctx, rec);
            DispatchResult {
                node_id: node.id.clone(),
                write: Some((output.handle, output.data)),
                fatal_error: None,
                cancelled: false,
            }
        }
        Err(err) => on_node_error(&node, &connections, err, rec, &ctx),
    }
}

/// Applies a node's `onError` policy (SPEC_FULL.md §4) to a raised
/// `NodeError`, producing the dispatch result the scheduler acts on.
fn on_node_error(
    node: &Node,
    connections: &[Connection],
    err: NodeError,
    mut rec: NodeExecutionRecord,
    ctx: &ExecutionContext,
) -> DispatchResult {
    match node.on_error {
        OnError::StopWorkflow => {
            let cancelled = err.kind == NodeErrorKind::Cancelled;
            rec.finish_error(
                if cancelled { NodeStatus::Cancelled } else { NodeStatus::Failed },
                err.to_string(),
            );
            finish_record(&ctx, rec);
            DispatchResult {
                node_id: node.id.clone(),
                write: None,
                fatal_error: if cancelled { None } else { Some(err) },
                cancelled,
            }
        }
        OnError::ContinueRegularOutput => {
            ctx.logger()
                .warn(&node.id, format!("swallowed {:?} error: {}", err.kind, err.message));
            rec.finish_success(NodeMap::new());
            finish_record(&ctx, rec);
            DispatchResult {
                node_id: node.id.clone(),
                write: Some((HANDLE_MAIN.to_string(), NodeMap::new())),
                fatal_error: None,
                cancelled: false,
            }
        }
        OnError::ContinueErrorOutput => {
            let error_wired = connections
                .iter()
                .any(|c| c.source_node_id == node.id && c.source_handle_id == HANDLE_ERROR);
            ctx.logger()
                .warn(&node.id, format!("routed {:?} error to error handle: {}", err.kind, err.message));
            let mut payload = NodeMap::new();
            payload.insert("error".to_string(), error_to_value(&err));
            rec.finish_success(payload.clone());
            finish_record(&ctx, rec);
            let handle = if error_wired { HANDLE_ERROR } else { HANDLE_MAIN };
            DispatchResult {
                node_id: node.id.clone(),
                write: Some((handle.to_string(), payload)),
                fatal_error: None,
                cancelled: false,
            }
        }
    }
}

pub(crate) fn error_to_value(err: &NodeError) -> Value {
    let mut m = NodeMap::new();
    m.insert("kind".to_string(), Value::String(format!("{:?}", err.kind).to_uppercase()));
    m.insert("message".to_string(), Value::String(err.message.clone()));
    if let Some(cause) = &err.cause {
        m.insert("cause".to_string(), error_to_value(cause));
    }
    Value::Object(m)
}

/// Resolves `node.parameters` (spec §4.1, §4.5 step 5) against a scope
/// binding `$input` to the composed input, `$nodes` to recorded outputs,
/// `$vars` to context variables, returning a clone of `node` with resolved
/// parameters.
fn resolve_node(node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<Node, expression::ExpressionError> {
    let nodes_scope = ctx.node_outputs_snapshot();
    let vars_scope = ctx.variables_snapshot();
    let input_value = Value::Object(input.clone());
    let scope = Scope {
        input: &input_value,
        nodes: &nodes_scope,
        vars: &vars_scope,
    };
    let resolved = expression::resolve(&Value::Object(node.parameters.clone()), &scope)?;
    let mut out = node.clone();
    out.parameters = match resolved {
        Value::Object(m) => m,
        _ => node.parameters.clone(),
    };
    Ok(out)
}

async fn dispatch_merge_arrival(
    node: Arc<Node>,
    connection_id: String,
    payload: NodeMap,
    ctx: ExecutionContext,
) -> DispatchResult {
    let mut rec = NodeExecutionRecord::started(&node.id, &node.name, &node.node_type, payload.clone());

    if ctx.is_cancelled() {
        rec.finish_error(NodeStatus::Cancelled, "execution cancelled".to_string());
        finish_record(&ctx, rec);
        return DispatchResult {
            node_id: node.id.clone(),
            write: None,
            fatal_error: None,
            cancelled: true,
        };
    }

    let spec = match build_merge_spec(&node) {
        Ok(spec) => spec,
        Err(msg) => {
            rec.finish_error(NodeStatus::Failed, msg.clone());
            finish_record(&ctx, rec);
            return DispatchResult {
                node_id: node.id.clone(),
                write: None,
                fatal_error: Some(NodeError::config(msg)),
                cancelled: false,
            };
        }
    };

    let barrier = match ctx.get_barrier(&node.id, spec) {
        Ok(b) => b,
        Err(e) => {
            rec.finish_error(NodeStatus::Failed, e.to_string());
            finish_record(&ctx, rec);
            return DispatchResult {
                node_id: node.id.clone(),
                write: None,
                fatal_error: Some(NodeError::permanent(e.to_string())),
                cancelled: false,
            };
        }
    };

    let _ = &connection_id; // consumed for bookkeeping by the caller only
    let outcome = barrier.arrive(payload, &ctx.cancellation_signal()).await;
    match outcome {
        BarrierOutcome::Proceed(data) => {
            let timed_out = matches!(data.get("_timedOut"), Some(Value::Bool(true)));
            rec.finish_success(data.clone());
            finish_record(&ctx, rec);
            if timed_out {
                DispatchResult {
                    node_id: node.id.clone(),
                    write: None,
                    fatal_error: Some(NodeError::timeout(format!(
                        "merge node '{}' timed out waiting for arrivals",
                        node.id
                    ))),
                    cancelled: false,
                }
            } else {
                DispatchResult {
                    node_id: node.id.clone(),
                    write: Some((HANDLE_MAIN.to_string(), data)),
                    fatal_error: None,
                    cancelled: false,
                }
            }
        }
        BarrierOutcome::Suppressed(data) => {
            let cancelled = matches!(data.get("_cancelled"), Some(Value::Bool(true)));
            if cancelled {
                rec.finish_error(NodeStatus::Cancelled, "merge cancelled".to_string());
            } else {
                rec.finish_success(data);
            }
            finish_record(&ctx, rec);
            DispatchResult {
                node_id: node.id.clone(),
                write: None,
                fatal_error: None,
                cancelled,
            }
        }
    }
}

fn build_merge_spec(node: &Node) -> Result<MergeSpec, String> {
    let mode = match node.parameters.get("mode").and_then(|v| v.as_str()) {
        Some("waitAll") | None => MergeMode::WaitAll,
        Some("waitAny") => MergeMode::WaitAny,
        Some("append") => MergeMode::Append,
        Some("merge") => MergeMode::Merge,
        Some("passThrough") => MergeMode::PassThrough,
        Some(other) => return Err(format!("merge node '{}': unknown mode '{other}'", node.id)),
    };
    let input_count = node
        .parameters
        .get("inputCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(1)
        .max(1) as usize;
    let timeout = node
        .parameters
        .get("timeout")
        .and_then(|v| v.as_f64())
        .map(Duration::from_secs_f64);
    let output_key = node
        .parameters
        .get("outputKey")
        .and_then(|v| v.as_str())
        .unwrap_or("merged")
        .to_string();
    let wait_for_all = node
        .parameters
        .get("waitForAll")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    Ok(MergeSpec {
        mode,
        input_count,
        timeout,
        output_key,
        wait_for_all,
    })
}
