//! Connection (typed data edge) definition and handle constants.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default handle pair used by nodes with a single input/output.
pub const HANDLE_MAIN: &str = "main";
/// `if` node output handles.
pub const HANDLE_TRUE: &str = "true";
pub const HANDLE_FALSE: &str = "false";
/// `loop` node's body subgraph entry handle.
pub const HANDLE_BODY: &str = "body";
/// `tryCatch` handles.
pub const HANDLE_TRY: &str = "try";
pub const HANDLE_CATCH: &str = "catch";
/// Reserved handle a node's `onError=continueErrorOutput` routes to, when
/// wired (SPEC_FULL.md §4 "Node-level `onError` behavior").
pub const HANDLE_ERROR: &str = "error";

/// A directed edge from `(sourceNodeId, sourceHandleId)` to
/// `(targetNodeId, targetHandleId)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_node_id: String,
    pub source_handle_id: String,
    pub target_node_id: String,
    pub target_handle_id: String,
}

impl Connection {
    pub fn new(
        source_node_id: impl Into<String>,
        source_handle_id: impl Into<String>,
        target_node_id: impl Into<String>,
        target_handle_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_node_id: source_node_id.into(),
            source_handle_id: source_handle_id.into(),
            target_node_id: target_node_id.into(),
            target_handle_id: target_handle_id.into(),
        }
    }

    /// Convenience for the common `("main", "main")` pair.
    pub fn main(source_node_id: impl Into<String>, target_node_id: impl Into<String>) -> Self {
        Self::new(source_node_id, HANDLE_MAIN, target_node_id, HANDLE_MAIN)
    }
}
