//! The engine's closed error-kind set (spec §7).

use thiserror::Error;

/// Runtime error kinds a `NodeExecutor` can raise. `retry` only retries
/// `Transient`/`Timeout` whose `retryOn` predicate holds; everything else
/// surfaces straight to the scheduler's failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeErrorKind {
    Transient,
    Permanent,
    Timeout,
    Cancelled,
    Config,
}

/// A node execution failure. Carries an optional cause chain - the original
/// system this was distilled from attaches one rather than a bare string
/// (see `SPEC_FULL.md` §4).
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
    pub cause: Option<Box<NodeError>>,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Cancelled, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Config, message)
    }

    pub fn with_cause(mut self, cause: NodeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Top-level engine error surfaced by the Engine API (spec §6, §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] flow_workflow::WorkflowError),

    #[error("expression error: {0}")]
    Expression(#[from] crate::expression::ExpressionError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("execution '{0}' is not paused")]
    NotPaused(String),
}
