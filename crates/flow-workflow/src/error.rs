//! Error types shared by the data-model crate.

use thiserror::Error;

/// Structural errors surfaced by [`crate::workflow::Workflow::validate`].
///
/// This is the `ValidationError` of spec.md §7 - pre-run, structural, never
/// raised mid-execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("node id '{0}' is not unique within the workflow")]
    DuplicateNodeId(String),

    #[error("connection '{connection_id}' references unknown node '{node_id}'")]
    UnknownConnectionEndpoint {
        connection_id: String,
        node_id: String,
    },

    #[error("workflow has no trigger node")]
    NoTrigger,

    #[error("more than one trigger node matches the requested trigger")]
    AmbiguousTrigger,

    #[error("workflow contains a cycle through node '{0}' not mediated by a loop node")]
    IllegalCycle(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),
}
