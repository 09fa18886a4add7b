//! `NodeExecutor` trait and registry (spec §4.2, component C2).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flow_workflow::{Node, NodeMap, HANDLE_MAIN};

use crate::context::ExecutionContext;
use crate::error::NodeError;

/// A node's produced output, tagged with the handle it was emitted on.
/// Non-branching nodes always emit on `"main"`; `if`/`switch` pick the
/// branch handle; `parallel`'s inline mode has no single handle (see
/// `ParallelExecutor`, which bypasses this trait for its subgraphs).
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub handle: String,
    pub data: NodeMap,
}

impl NodeOutput {
    pub fn main(data: NodeMap) -> Self {
        Self {
            handle: HANDLE_MAIN.to_string(),
            data,
        }
    }

    pub fn on(handle: impl Into<String>, data: NodeMap) -> Self {
        Self {
            handle: handle.into(),
            data,
        }
    }
}

/// Plug-in contract every node type implements (spec §6 "NodeExecutor
/// plug-in contract"). Structural executors (§4.3) additionally hold a
/// handle back into the `Scheduler` to launch sub-branches; that capability
/// lives in `crate::structural`, not in this trait, to keep the contract
/// uniform for library executors.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> &'static str;

    async fn execute(
        &self,
        node: &Node,
        input: &NodeMap,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError>;
}

/// Maps `type -> NodeExecutor`. Registration is one-shot at engine
/// construction (spec §4.2).
#[derive(Default)]
pub struct NodeExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors
            .insert(executor.node_type().to_string(), executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// A registry with only the mandatory core control executors and
    /// trigger pass-throughs registered - no library node ever needs to be
    /// present for the core to compile and run (spec §9 "Plugin boundary").
    pub fn core() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ManualTriggerExecutor));
        registry.register(Arc::new(ScheduleTriggerExecutor));
        registry.register(Arc::new(WebhookTriggerExecutor));
        registry.register(Arc::new(FileTriggerExecutor));
        registry.register(Arc::new(NoOpExecutor));
        registry.register(Arc::new(SetExecutor));
        crate::structural::register_all(&mut registry);
        registry
    }
}

macro_rules! passthrough_trigger {
    ($name:ident, $type_name:literal) => {
        pub struct $name;

        #[async_trait]
        impl NodeExecutor for $name {
            fn node_type(&self) -> &'static str {
                $type_name
            }

            async fn execute(
                &self,
                _node: &Node,
                input: &NodeMap,
                _ctx: &ExecutionContext,
            ) -> Result<NodeOutput, NodeError> {
                Ok(NodeOutput::main(input.clone()))
            }
        }
    };
}

// Trigger nodes are normally seeded directly by the scheduler (spec §4.5
// step 2), which deposits `initialInput` as their output without going
// through the registry. These exist so a trigger dispatched in isolation
// (e.g. `submit` with `dryRun`) still resolves to a well-defined executor.
passthrough_trigger!(ManualTriggerExecutor, "manualTrigger");
passthrough_trigger!(ScheduleTriggerExecutor, "scheduleTrigger");
passthrough_trigger!(WebhookTriggerExecutor, "webhookTrigger");
passthrough_trigger!(FileTriggerExecutor, "fileTrigger");

/// Transparent pass-through, useful as a graph junction point.
pub struct NoOpExecutor;

#[async_trait]
impl NodeExecutor for NoOpExecutor {
    fn node_type(&self) -> &'static str {
        "noOp"
    }

    async fn execute(
        &self,
        _node: &Node,
        input: &NodeMap,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::main(input.clone()))
    }
}

/// Assigns/overwrites fields on the input payload from resolved parameters.
/// A minimal stand-in for the library "Set" node, kept around because the
/// end-to-end scenarios in spec §4.3 need *some* node that produces known
/// data; not part of the structural core.
pub struct SetExecutor;

#[async_trait]
impl NodeExecutor for SetExecutor {
    fn node_type(&self) -> &'static str {
        "set"
    }

    async fn execute(
        &self,
        node: &Node,
        input: &NodeMap,
        _ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let mut out = input.clone();
        if let Some(serde_json::Value::Object(fields)) = node.parameters.get("fields") {
            for (k, v) in fields {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(NodeOutput::main(out))
    }
}
