//! Per-execution mutable state (spec §4.4, component C4).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use flow_workflow::value::Value;
use flow_workflow::{NodeExecutionRecord, NodeMap, Workflow};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::barrier::{Barrier, MergeSpec};
use crate::error::EngineError;
use crate::inspector::Inspector;
use crate::scheduler::Scheduler;

/// Structured log event (spec §4.4 `logger()`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub node_id: Option<String>,
    pub message: String,
    pub data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Structured event sink handed to executors via `ExecutionContext::logger`.
/// Forwards to `tracing` and, when the dev-mode inspector is attached, also
/// appends to its in-memory event log (spec §4.7).
pub struct Logger {
    execution_id: String,
    inspector: Option<Arc<Inspector>>,
}

impl Logger {
    pub fn log(&self, level: LogLevel, node_id: Option<&str>, message: impl Into<String>, data: serde_json::Map<String, Value>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(execution_id = %self.execution_id, node_id, %message),
            LogLevel::Warn => tracing::warn!(execution_id = %self.execution_id, node_id, %message),
            LogLevel::Error => tracing::error!(execution_id = %self.execution_id, node_id, %message),
        }
        if let Some(inspector) = &self.inspector {
            inspector.push_event(LogEvent {
                level,
                node_id: node_id.map(str::to_string),
                message,
                data,
            });
        }
    }

    pub fn info(&self, node_id: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, Some(node_id), message, serde_json::Map::new());
    }

    pub fn warn(&self, node_id: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, Some(node_id), message, serde_json::Map::new());
    }

    pub fn error(&self, node_id: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, Some(node_id), message, serde_json::Map::new());
    }
}

/// Shared, thread-safe per-execution state. Cheaply `Clone`-able (an `Arc`
/// wrapper around the interior), so it can be handed to every worker task.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow: Arc<Workflow>,
    pub initial_input: NodeMap,
    inner: Arc<Inner>,
}

struct Inner {
    variables: DashMap<String, Value>,
    node_outputs: DashMap<String, (String, NodeMap)>,
    node_executions: Mutex<Vec<NodeExecutionRecord>>,
    barriers: DashMap<String, Arc<Barrier>>,
    rate_limiters: DashMap<String, Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>>,
    cancellation: CancellationToken,
    timed_out: std::sync::atomic::AtomicBool,
    logger: Logger,
    dev_mode: bool,
    step_mode: bool,
    step_signal: tokio::sync::Notify,
    paused: std::sync::atomic::AtomicBool,
    inspector: Option<Arc<Inspector>>,
    scheduler: Arc<Scheduler>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: String,
        workflow: Arc<Workflow>,
        initial_input: NodeMap,
        dev_mode: bool,
        step_mode: bool,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let inspector = if dev_mode {
            Some(Arc::new(Inspector::new()))
        } else {
            None
        };
        Self {
            execution_id: execution_id.clone(),
            workflow,
            initial_input,
            inner: Arc::new(Inner {
                variables: DashMap::new(),
                node_outputs: DashMap::new(),
                node_executions: Mutex::new(Vec::new()),
                barriers: DashMap::new(),
                rate_limiters: DashMap::new(),
                cancellation: CancellationToken::new(),
                timed_out: std::sync::atomic::AtomicBool::new(false),
                logger: Logger {
                    execution_id,
                    inspector: inspector.clone(),
                },
                dev_mode,
                step_mode: step_mode && dev_mode,
                step_signal: tokio::sync::Notify::new(),
                paused: std::sync::atomic::AtomicBool::new(false),
                inspector,
                scheduler,
            }),
        }
    }

    /// Handle back to the scheduler that owns this execution, used by
    /// structural executors (`parallel`, `loop`, `tryCatch`) to run
    /// sub-branches under the same worker pool and concurrency bound
    /// (spec §9 Open Questions: `loop.parallel` shares the global pool).
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn get(&self, name: &str) -> Value {
        self.inner
            .variables
            .get(name)
            .map(|v| v.clone())
            .unwrap_or(Value::Null)
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.variables.insert(name.into(), value);
    }

    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Idempotent: first writer wins, later calls for the same node id are
    /// ignored. Returns whether this call was the one that actually wrote
    /// (used by the scheduler to decide whether to cascade readiness).
    pub fn record_node_output(&self, node_id: &str, handle: &str, output: NodeMap) -> bool {
        match self.inner.node_outputs.entry(node_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((handle.to_string(), output));
                true
            }
        }
    }

    pub fn get_node_output(&self, node_id: &str) -> Option<NodeMap> {
        self.inner.node_outputs.get(node_id).map(|v| v.value().1.clone())
    }

    /// Like [`Self::get_node_output`] but also returns the handle the output
    /// was emitted on, needed by the scheduler's readiness check for
    /// handle-aware nodes (`if`/`switch`/`parallel`).
    pub fn get_node_output_handle(&self, node_id: &str) -> Option<(String, NodeMap)> {
        self.inner.node_outputs.get(node_id).map(|v| v.value().clone())
    }

    pub fn node_outputs_snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .node_outputs
            .iter()
            .map(|e| (e.key().clone(), Value::Object(e.value().1.clone())))
            .collect()
    }

    /// Per-`(executionId, nodeId)` token-bucket spacing for `rateLimit`
    /// nodes (spec §4.3 `rateLimit`). Blocks the caller until `min_interval`
    /// has elapsed since the last acquisition for this node.
    pub async fn rate_limit_acquire(&self, node_id: &str, min_interval: std::time::Duration) {
        let slot = self
            .inner
            .rate_limiters
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone();
        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    /// Append-only per-node execution record (spec §3 `nodeExecutions`). A
    /// `merge` node accumulates one record per arriving branch rather than
    /// one per node (spec §4.5 "Fan-in via merge").
    pub fn append_node_execution(&self, record: NodeExecutionRecord) {
        self.inner.node_executions.lock().push(record);
    }

    pub fn node_executions_snapshot(&self) -> Vec<NodeExecutionRecord> {
        self.inner.node_executions.lock().clone()
    }

    /// Factory that returns the per-`(executionId, nodeId)` barrier,
    /// constructed on first call with `spec`, returned as-is thereafter.
    /// Divergent specs from later callers are an `InternalInconsistency`.
    pub fn get_barrier(&self, node_id: &str, spec: MergeSpec) -> Result<Arc<Barrier>, EngineError> {
        if let Some(existing) = self.inner.barriers.get(node_id) {
            if existing.spec != spec {
                return Err(EngineError::InternalInconsistency(format!(
                    "merge node '{node_id}' observed with divergent merge spec"
                )));
            }
            return Ok(existing.clone());
        }
        let barrier = Arc::new(Barrier::new(spec.clone()));
        match self.inner.barriers.entry(node_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().spec != spec {
                    return Err(EngineError::InternalInconsistency(format!(
                        "merge node '{node_id}' observed with divergent merge spec"
                    )));
                }
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(barrier.clone());
                Ok(barrier)
            }
        }
    }

    pub fn cancellation_signal(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
        self.inner.step_signal.notify_waiters();
    }

    /// Like [`Self::cancel`] but records that the cancellation was raised by
    /// the submitter's `timeout` option (spec §6 `submit` opts), not an
    /// explicit user `cancel()` call, so the scheduler can report `FAILED`
    /// with a `TIMEOUT` error instead of `CANCELLED` (spec §7).
    pub fn cancel_for_timeout(&self) {
        self.inner.timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn dev_mode(&self) -> bool {
        self.inner.dev_mode
    }

    pub fn inspector(&self) -> Option<Arc<Inspector>> {
        self.inner.inspector.clone()
    }

    /// Step-execution gate (spec §4.7): when step mode is active, the
    /// scheduler awaits `continue` before dispatching the next ready node.
    pub async fn await_step(&self) {
        if !self.inner.step_mode {
            return;
        }
        self.inner.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        loop {
            // Register before checking, not after: `step_continue`/`cancel`
            // flip the flag and call `notify_waiters()` without holding any
            // lock we serialize against here, so checking first would leave
            // a window where a continue/cancel between the check and the
            // `notified()` call is silently missed.
            let wait = self.inner.step_signal.notified();
            if self.is_cancelled() || !self.inner.paused.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            wait.await;
        }
    }

    pub fn step_continue(&self) {
        self.inner.paused.store(false, std::sync::atomic::Ordering::SeqCst);
        self.inner.step_signal.notify_waiters();
    }

    pub fn step_reset(&self) {
        self.inner.paused.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(std::sync::atomic::Ordering::SeqCst)
    }
}
