//! Node definition.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::NodeMap;

/// A node's declared behavior when it raises an unhandled `NodeError` and
/// no `tryCatch` ancestor claims it (SPEC_FULL.md §4 "Node-level `onError`
/// behavior", supplementing spec.md §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    /// Default: the error fails the execution (spec.md §4.6's documented
    /// behavior).
    #[default]
    StopWorkflow,
    /// The error is swallowed; the node's output becomes an empty success
    /// payload and execution continues.
    ContinueRegularOutput,
    /// The error is routed to the node's reserved `error` handle if wired;
    /// otherwise behaves like `ContinueRegularOutput`.
    ContinueErrorOutput,
}

/// Layout position. Ignored by the engine; carried through for round-trip
/// fidelity with the persisted format (spec §3, §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A workflow node instance.
///
/// `parameters` may contain templates (`{{ expr }}`) and references
/// (`$input...`, `$nodes...`, `$vars...`) resolved by the
/// [`ExpressionResolver`](../flow_core/expression) before the node's executor
/// runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique within the workflow.
    pub id: String,
    /// Selector into the `NodeExecutor` registry.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub position: Position,
    /// Arbitrary JSON parameters, possibly templated.
    #[serde(default)]
    pub parameters: NodeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Node {
    pub fn new(node_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_type: node_type.into(),
            name: name.into(),
            disabled: false,
            on_error: OnError::default(),
            position: Position::default(),
            parameters: NodeMap::new(),
            notes: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: crate::value::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// A node is a trigger when its type name ends in `Trigger` (glossary:
    /// "a node whose type ends in `Trigger`; the only allowed entry point of
    /// an execution").
    pub fn is_trigger(&self) -> bool {
        self.node_type.ends_with("Trigger")
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self.node_type.as_str(),
            "if" | "switch" | "merge" | "parallel" | "loop" | "tryCatch" | "retry" | "rateLimit"
        )
    }
}
