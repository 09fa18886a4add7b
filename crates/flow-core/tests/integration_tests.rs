//! End-to-end scheduler tests against the literal scenarios in spec §4.3/§8
//! (S1-S6): conditional exclusive merge, parallel fan-out with an append
//! barrier, a blocking waitAll barrier, bounded retry on a transient
//! failure, mid-run cancellation, and loop aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flow_core::{Engine, ExecutionContext, NodeError, NodeErrorKind, NodeExecutor, NodeExecutorRegistry, NodeOutput, SubmitOptions};
use flow_workflow::value::Value;
use flow_workflow::{Connection, ExecutionStatus, Node, NodeMap, NodeStatus, Workflow, HANDLE_BODY};
use serde_json::json;

fn trigger() -> Node {
    Node::new("manualTrigger", "Trigger").with_id("trigger")
}

fn set_node(id: &str, fields: serde_json::Map<String, Value>) -> Node {
    Node::new("set", id).with_id(id).with_parameter("fields", Value::Object(fields))
}

fn fields(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Emits `{sq: item*item}` only, reading `item` off its composed input -
/// stands in for a minimal body node so the loop-aggregation test (S6) can
/// check against the literal expected output without a generic `set`
/// node's input pass-through muddying the comparison.
struct SquareExecutor;

#[async_trait]
impl NodeExecutor for SquareExecutor {
    fn node_type(&self) -> &'static str {
        "square"
    }

    async fn execute(&self, _node: &Node, input: &NodeMap, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let item = input.get("item").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut out = NodeMap::new();
        out.insert("sq".to_string(), json!(item * item));
        Ok(NodeOutput::main(out))
    }
}

/// Raises `TRANSIENT` for its first `fail_times` calls, then succeeds with
/// `{done: true}` (S4 "retry on transient").
#[derive(Clone)]
struct FlakyExecutor {
    calls: Arc<AtomicUsize>,
    fail_times: usize,
}

impl FlakyExecutor {
    fn new(fail_times: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_times,
        }
    }
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    fn node_type(&self) -> &'static str {
        "flaky"
    }

    async fn execute(&self, _node: &Node, _input: &NodeMap, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(NodeError::transient(format!("transient failure #{}", attempt + 1)));
        }
        let mut out = NodeMap::new();
        out.insert("done".to_string(), Value::Bool(true));
        Ok(NodeOutput::main(out))
    }
}

/// Sleeps until either a long duration elapses or cancellation fires,
/// whichever comes first, surfacing `NodeError::cancelled` in the latter
/// case (S5 "cancellation mid-run").
struct SleepExecutor;

#[async_trait]
impl NodeExecutor for SleepExecutor {
    fn node_type(&self) -> &'static str {
        "sleep"
    }

    async fn execute(&self, _node: &Node, input: &NodeMap, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(NodeOutput::main(input.clone())),
            _ = ctx.cancellation_signal().cancelled() => Err(NodeError::cancelled("execution cancelled")),
        }
    }
}

fn engine_with(executors: Vec<Arc<dyn NodeExecutor>>) -> Engine {
    let mut registry = NodeExecutorRegistry::core();
    for executor in executors {
        registry.register(executor);
    }
    Engine::new(registry, 8, false)
}

// S1: if -> merge (exclusive passThrough). Only the fired branch ever
// reaches the barrier; the first (and only) arrival returns immediately.
#[tokio::test]
async fn if_then_exclusive_merge_matches_literal_output() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("s1");
    let if_node = Node::new("if", "If")
        .with_id("if1")
        .with_parameter("condition", Value::String("{{ $input.count }} > 10".to_string()));
    let merge = Node::new("merge", "Merge")
        .with_id("merge1")
        .with_parameter("mode", Value::String("passThrough".to_string()))
        .with_parameter("waitForAll", Value::Bool(false))
        .with_parameter("inputCount", json!(2));
    wf.nodes = vec![trigger(), if_node, merge];
    wf.connections = vec![
        Connection::main("trigger", "if1"),
        Connection::new("if1", "true", "merge1", "main"),
        Connection::new("if1", "false", "merge1", "main"),
    ];

    let mut input = NodeMap::new();
    input.insert("count".to_string(), json!(15));

    let id = engine.submit(wf, input, SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let out = exec.output_data.unwrap();
    assert_eq!(out.get("count"), Some(&json!(15)));
    assert_eq!(out.get("conditionResult"), Some(&json!(true)));
    assert_eq!(out.get("branch"), Some(&json!("true")));
    assert_eq!(out.get("_mergeMode"), Some(&json!("passThrough")));
    assert_eq!(out.get("_exclusive"), Some(&json!(true)));
    assert_eq!(out.get("_inputsReceived"), Some(&json!(1)));
}

// S2: parallel fan-out of 3 -> append merge. The merged sequence has every
// branch's payload; order may reflect arrival so only the multiset of `v`
// values is checked (spec §8 "ordering may reflect arrival order").
#[tokio::test]
async fn parallel_fan_out_append_merge_collects_every_branch() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("s2");
    let parallel = Node::new("parallel", "Parallel").with_id("par1").with_parameter("branches", json!(3));
    let a = set_node("a", fields(&[("v", json!("a"))]));
    let b = set_node("b", fields(&[("v", json!("b"))]));
    let c = set_node("c", fields(&[("v", json!("c"))]));
    let merge = Node::new("merge", "Merge")
        .with_id("merge1")
        .with_parameter("mode", Value::String("append".to_string()))
        .with_parameter("inputCount", json!(3));
    wf.nodes = vec![trigger(), parallel, a, b, c, merge];
    wf.connections = vec![
        Connection::main("trigger", "par1"),
        Connection::main("par1", "a"),
        Connection::main("par1", "b"),
        Connection::main("par1", "c"),
        Connection::main("a", "merge1"),
        Connection::main("b", "merge1"),
        Connection::main("c", "merge1"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let out = exec.output_data.unwrap();
    let merged = out.get("merged").and_then(|v| v.as_array()).expect("merged array");
    assert_eq!(merged.len(), 3);
    let mut values: Vec<&str> = merged.iter().map(|m| m.get("v").and_then(|v| v.as_str()).unwrap()).collect();
    values.sort();
    assert_eq!(values, vec!["a", "b", "c"]);
}

// S3: two branches into a waitAll barrier - both callers observe the same
// barrier payload.
#[tokio::test]
async fn wait_all_barrier_releases_every_caller_with_equal_payload() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("s3");
    let parallel = Node::new("parallel", "Parallel").with_id("par1").with_parameter("branches", json!(2));
    let left = set_node("left", fields(&[("branch", json!("left"))]));
    let right = set_node("right", fields(&[("branch", json!("right"))]));
    let merge = Node::new("merge", "Merge")
        .with_id("merge1")
        .with_parameter("mode", Value::String("waitAll".to_string()))
        .with_parameter("inputCount", json!(2));
    wf.nodes = vec![trigger(), parallel, left, right, merge];
    wf.connections = vec![
        Connection::main("trigger", "par1"),
        Connection::main("par1", "left"),
        Connection::main("par1", "right"),
        Connection::main("left", "merge1"),
        Connection::main("right", "merge1"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let out = exec.output_data.unwrap();
    assert_eq!(out.get("_mergeMode"), Some(&json!("waitAll")));
    let merged = out.get("merged").and_then(|v| v.as_array()).expect("merged array");
    assert_eq!(merged.len(), 2);

    let merge_records: Vec<_> = exec.node_executions.iter().filter(|r| r.node_id == "merge1").collect();
    assert_eq!(merge_records.len(), 2, "merge dispatched once per arrival");
    assert!(merge_records.iter().all(|r| r.status == NodeStatus::Success));
}

// S4: retry wraps a node that fails TRANSIENT twice then succeeds.
#[tokio::test]
async fn retry_recovers_from_transient_failures() {
    let flaky = Arc::new(FlakyExecutor::new(2));
    let engine = engine_with(vec![flaky.clone()]);

    let mut wf = Workflow::new("s4");
    let retry = Node::new("retry", "Retry")
        .with_id("retry1")
        .with_parameter("maxAttempts", json!(3))
        .with_parameter("backoff", Value::String("fixed".to_string()))
        .with_parameter("initialDelayMs", json!(1));
    let flaky_node = Node::new("flaky", "Flaky").with_id("flaky1");
    wf.nodes = vec![trigger(), retry, flaky_node];
    wf.connections = vec![
        Connection::main("trigger", "retry1"),
        Connection::new("retry1", HANDLE_BODY, "flaky1", "main"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let flaky_records: Vec<_> = exec.node_executions.iter().filter(|r| r.node_id == "flaky1").collect();
    assert_eq!(flaky_records.len(), 3);
    assert_eq!(flaky_records.last().unwrap().status, NodeStatus::Success);
    assert!(flaky_records[..2].iter().all(|r| r.status == NodeStatus::Failed));
}

// S5: cancel mid-run - the running node is recorded CANCELLED, its
// downstream never dispatches, and the execution itself is CANCELLED (not
// FAILED).
#[tokio::test]
async fn cancellation_mid_run_stops_downstream_dispatch() {
    let engine = engine_with(vec![Arc::new(SleepExecutor)]);
    let mut wf = Workflow::new("s5");
    let sleep_node = Node::new("sleep", "Sleep").with_id("sleep1");
    let downstream = Node::new("noOp", "Downstream").with_id("after");
    wf.nodes = vec![trigger(), sleep_node, downstream];
    wf.connections = vec![Connection::main("trigger", "sleep1"), Connection::main("sleep1", "after")];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel(&id).unwrap();

    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    let sleep_rec = exec.node_executions.iter().find(|r| r.node_id == "sleep1").unwrap();
    assert_eq!(sleep_rec.status, NodeStatus::Cancelled);
    assert!(
        !exec.node_executions.iter().any(|r| r.node_id == "after"),
        "downstream of a cancelled node must never dispatch"
    );
}

// S6: loop over [1,2,3] sequentially, body squares the item.
#[tokio::test]
async fn loop_aggregates_body_outputs_in_order() {
    let engine = engine_with(vec![Arc::new(SquareExecutor)]);
    let mut wf = Workflow::new("s6");
    let loop_node = Node::new("loop", "Loop")
        .with_id("loop1")
        .with_parameter("items", Value::Array(vec![json!(1), json!(2), json!(3)]))
        .with_parameter("batchSize", json!(1))
        .with_parameter("parallel", Value::Bool(false));
    let square = Node::new("square", "Square").with_id("square1");
    wf.nodes = vec![trigger(), loop_node, square];
    wf.connections = vec![
        Connection::main("trigger", "loop1"),
        Connection::new("loop1", HANDLE_BODY, "square1", "main"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let out = exec.output_data.unwrap();
    assert_eq!(out.get("results"), Some(&json!([{"sq": 1}, {"sq": 4}, {"sq": 9}])));
}

// A disabled node is a transparent pass-through: its executor never runs.
#[tokio::test]
async fn disabled_node_is_a_transparent_pass_through() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("disabled");
    let disabled = set_node("setter", fields(&[("added", json!(true))])).with_disabled(true);
    wf.nodes = vec![trigger(), disabled];
    wf.connections = vec![Connection::main("trigger", "setter")];

    let mut input = NodeMap::new();
    input.insert("original".to_string(), json!(1));

    let id = engine.submit(wf, input, SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    let out = exec.output_data.unwrap();
    assert_eq!(out.get("original"), Some(&json!(1)));
    assert_eq!(out.get("added"), None, "disabled node must not run its executor");
}

// switch picks exactly one handle among several cases.
#[tokio::test]
async fn switch_activates_exactly_one_case() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("switch");
    let switch = Node::new("switch", "Switch").with_id("sw1").with_parameter(
        "cases",
        Value::Array(vec![
            json!({"when": "$input.tier == 'gold'", "handle": "gold"}),
            json!({"when": "$input.tier == 'silver'", "handle": "silver"}),
        ]),
    );
    let gold = set_node("gold_out", fields(&[("matched", json!("gold"))]));
    let silver = set_node("silver_out", fields(&[("matched", json!("silver"))]));
    wf.nodes = vec![trigger(), switch, gold, silver];
    wf.connections = vec![
        Connection::main("trigger", "sw1"),
        Connection::new("sw1", "gold", "gold_out", "main"),
        Connection::new("sw1", "silver", "silver_out", "main"),
    ];

    let mut input = NodeMap::new();
    input.insert("tier".to_string(), json!("silver"));

    let id = engine.submit(wf, input, SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    let out = exec.output_data.unwrap();
    assert_eq!(out.get("matched"), Some(&json!("silver")));
    assert!(!exec.node_executions.iter().any(|r| r.node_id == "gold_out"));
}

// tryCatch: the catch subgraph only runs when the try subgraph raises.
#[tokio::test]
async fn try_catch_routes_to_catch_only_on_failure() {
    #[derive(Clone)]
    struct AlwaysFails;
    #[async_trait]
    impl NodeExecutor for AlwaysFails {
        fn node_type(&self) -> &'static str {
            "alwaysFails"
        }
        async fn execute(&self, _n: &Node, _i: &NodeMap, _c: &ExecutionContext) -> Result<NodeOutput, NodeError> {
            Err(NodeError::permanent("boom"))
        }
    }

    let engine = engine_with(vec![Arc::new(AlwaysFails)]);
    let mut wf = Workflow::new("try-catch");
    let try_catch = Node::new("tryCatch", "TryCatch").with_id("tc1");
    let failing = Node::new("alwaysFails", "Boom").with_id("boom1");
    let catcher = set_node("caught", fields(&[("recovered", json!(true))]));
    wf.nodes = vec![trigger(), try_catch, failing, catcher];
    wf.connections = vec![
        Connection::main("trigger", "tc1"),
        Connection::new("tc1", "try", "boom1", "main"),
        Connection::new("tc1", "catch", "caught", "main"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
    let out = exec.output_data.unwrap();
    assert_eq!(out.get("recovered"), Some(&json!(true)));
}

#[test]
fn workflow_json_round_trips() {
    let mut wf = Workflow::new("round-trip");
    wf.nodes = vec![trigger(), set_node("s", fields(&[("x", json!(1))]))];
    wf.connections = vec![Connection::main("trigger", "s")];

    let json = serde_json::to_value(&wf).unwrap();
    let restored: Workflow = serde_json::from_value(json.clone()).unwrap();
    let json_again = serde_json::to_value(&restored).unwrap();
    assert_eq!(json, json_again);
}

#[test]
fn node_error_kind_transient_is_retry_eligible() {
    assert_eq!(NodeError::transient("x").kind, NodeErrorKind::Transient);
}

// waitAny releases the first branch immediately; the later branch still
// dispatches the merge executor but carries `_stopExecution`, pruning its
// own downstream (spec §4.3 `merge` waitAny, §4.5 "transitive suppression").
#[tokio::test]
async fn wait_any_releases_first_arrival_and_prunes_the_rest() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("wait-any");
    let parallel = Node::new("parallel", "Parallel").with_id("par1").with_parameter("branches", json!(2));
    let fast = set_node("fast", fields(&[("who", json!("fast"))]));
    let slow = set_node("slow", fields(&[("who", json!("slow"))]));
    let merge = Node::new("merge", "Merge")
        .with_id("merge1")
        .with_parameter("mode", Value::String("waitAny".to_string()))
        .with_parameter("inputCount", json!(2));
    wf.nodes = vec![trigger(), parallel, fast, slow, merge];
    wf.connections = vec![
        Connection::main("trigger", "par1"),
        Connection::main("par1", "fast"),
        Connection::main("par1", "slow"),
        Connection::main("fast", "merge1"),
        Connection::main("slow", "merge1"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);

    let merge_records: Vec<_> = exec.node_executions.iter().filter(|r| r.node_id == "merge1").collect();
    assert_eq!(merge_records.len(), 2, "merge dispatched once per arrival even in waitAny");
    assert_eq!(exec.output_data.unwrap().get("_mergeMode"), Some(&json!("waitAny")));
}

// A merge node with no timeout configured and a single wired incoming edge
// (inputCount defaults to 1) releases immediately without ever blocking.
#[tokio::test]
async fn merge_times_out_and_fails_when_a_branch_never_arrives() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("merge-timeout");
    let parallel = Node::new("parallel", "Parallel").with_id("par1").with_parameter("branches", json!(2));
    let fast = set_node("fast", fields(&[("who", json!("fast"))]));
    // `slow` never connects to the merge - only `inputCount` (2) declares an
    // arrival the barrier will wait for that never actually comes.
    let slow = set_node("slow", fields(&[("who", json!("slow"))]));
    let merge = Node::new("merge", "Merge")
        .with_id("merge1")
        .with_parameter("mode", Value::String("waitAll".to_string()))
        .with_parameter("inputCount", json!(2))
        .with_parameter("timeout", json!(0.05));
    wf.nodes = vec![trigger(), parallel, fast, slow, merge];
    wf.connections = vec![
        Connection::main("trigger", "par1"),
        Connection::main("par1", "fast"),
        Connection::main("par1", "slow"),
        Connection::main("fast", "merge1"),
    ];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error_message.unwrap().contains("Timeout"));
}

// rateLimit enforces a minimum spacing between successive dispatches of its
// downstream edge (spec §4.3 `rateLimit`); two sequential loop iterations
// through it take at least the configured interval in total.
#[tokio::test]
async fn rate_limit_spaces_out_successive_dispatches() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("rate-limit");
    let loop_node = Node::new("loop", "Loop")
        .with_id("loop1")
        .with_parameter("items", Value::Array(vec![json!(1), json!(2)]))
        .with_parameter("batchSize", json!(1))
        .with_parameter("parallel", Value::Bool(false));
    let limiter = Node::new("rateLimit", "Limiter")
        .with_id("rl1")
        .with_parameter("interval", json!(50));
    wf.nodes = vec![trigger(), loop_node, limiter];
    wf.connections = vec![
        Connection::main("trigger", "loop1"),
        Connection::new("loop1", HANDLE_BODY, "rl1", "main"),
    ];

    let started = tokio::time::Instant::now();
    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "second iteration through the rate limiter must wait out the interval"
    );
}

// `parallel` with a malformed `branches` parameter fails softly: the node
// emits an error-shaped output rather than aborting the execution (spec §4.3
// `parallel`, §8 boundary behaviors).
#[tokio::test]
async fn parallel_invalid_branches_yields_error_shaped_output_not_a_failure() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("bad-parallel");
    let parallel = Node::new("parallel", "Parallel")
        .with_id("par1")
        .with_parameter("branches", Value::String("nonsense".to_string()));
    wf.nodes = vec![trigger(), parallel];
    wf.connections = vec![Connection::main("trigger", "par1")];

    let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
    let out = exec.output_data.unwrap();
    assert!(out.get("error").and_then(|v| v.as_str()).unwrap().contains("Invalid branches configuration"));
}

// `parallel` with an empty inline-branch array passes input through with
// `_branchCount=0` (spec §8 boundary behavior), stripped of the reserved
// marker by the time it reaches the terminal output.
#[tokio::test]
async fn parallel_empty_branches_passes_input_through() {
    let engine = engine_with(vec![]);
    let mut wf = Workflow::new("empty-parallel");
    let parallel = Node::new("parallel", "Parallel").with_id("par1").with_parameter("branches", Value::Array(vec![]));
    wf.nodes = vec![trigger(), parallel];
    wf.connections = vec![Connection::main("trigger", "par1")];

    let mut input = NodeMap::new();
    input.insert("x".to_string(), json!(1));

    let id = engine.submit(wf, input, SubmitOptions::default()).unwrap();
    let exec = engine.await_execution(&id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Success);
    assert_eq!(exec.output_data.unwrap().get("x"), Some(&json!(1)));
}
