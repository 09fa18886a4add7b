//! # flow-core
//!
//! The workflow execution engine: the `ExpressionResolver`, the
//! `NodeExecutor` registry and structural executors, the merge `Barrier`,
//! `ExecutionContext`, the concurrent `Scheduler`, and the dev-mode
//! inspector. Depends only on `flow-workflow` for the data model.

pub mod barrier;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod inspector;
pub mod scheduler;
pub mod structural;

pub use barrier::{Barrier, BarrierOutcome, MergeMode, MergeSpec};
pub use context::{ExecutionContext, LogEvent, LogLevel, Logger};
pub use engine::{Engine, SubmitOptions};
pub use error::{EngineError, NodeError, NodeErrorKind};
pub use executor::{NodeExecutor, NodeExecutorRegistry, NodeOutput};
pub use expression::{evaluate_condition, resolve, ExpressionError, Scope};
pub use inspector::{DebugBundle, HttpLogEntry, Inspector, NodeTiming};
pub use scheduler::{GraphOutcome, GraphStatus, Scheduler};
