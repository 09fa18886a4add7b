//! The Engine API (spec §6): `submit` / `await` / `cancel` / `step.continue`
//! / `step.reset`, plus debug-bundle export. This is the object triggers and
//! the dev-mode UI hold a handle to; it owns the table of in-flight and
//! terminal executions and drives each one's `Scheduler::run_workflow` to
//! completion on a spawned task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flow_workflow::{Execution, ExecutionStatus, NodeMap, TriggerType, Workflow};
use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::error::{EngineError, NodeErrorKind};
use crate::executor::NodeExecutorRegistry;
use crate::inspector::DebugBundle;
use crate::scheduler::{GraphStatus, Scheduler};

/// `submit`'s `opts` (spec §6 Engine API table).
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Validate and record a terminal execution without dispatching any
    /// node (spec §4.5 step 1's "pre-run validation requested").
    pub dry_run: bool,
    /// Pause before each dispatch awaiting `step.continue` (spec §4.7).
    /// Only takes effect if the engine itself was constructed with dev mode
    /// enabled (spec §4.7 "Step mode only activates when dev mode is also
    /// enabled").
    pub step_mode: bool,
    /// Execution-level wall-clock bound. On expiry the execution is
    /// cancelled cooperatively and finishes `FAILED` with a `TIMEOUT`
    /// error (spec §4.6, §7), distinct from an explicit `cancel()`.
    pub timeout: Option<Duration>,
    /// Which trigger node this request targets, when a workflow declares
    /// more than one (SPEC_FULL.md §4 "Execution `mode`/`triggerType`
    /// distinction").
    pub trigger_type: TriggerType,
}

#[derive(Clone)]
struct ExecutionHandle {
    execution: Arc<Mutex<Execution>>,
    ctx: ExecutionContext,
    status_rx: tokio::sync::watch::Receiver<ExecutionStatus>,
}

/// The engine. Cheaply `Clone`-able; every clone shares the same execution
/// table and worker pool.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<NodeExecutorRegistry>,
    scheduler: Arc<Scheduler>,
    dev_mode: bool,
    next_execution_id: Arc<AtomicU64>,
    executions: Arc<DashMap<String, ExecutionHandle>>,
}

impl Engine {
    pub fn new(registry: NodeExecutorRegistry, concurrency: usize, dev_mode: bool) -> Self {
        let registry = Arc::new(registry);
        Self {
            scheduler: Arc::new(Scheduler::new(registry.clone(), concurrency)),
            registry,
            dev_mode,
            next_execution_id: Arc::new(AtomicU64::new(1)),
            executions: Arc::new(DashMap::new()),
        }
    }

    /// An engine with only the mandatory core control executors registered
    /// (spec §9 "Plugin boundary") and worker parallelism defaulted to the
    /// number of logical processors (spec §4.5 step 4).
    pub fn core(dev_mode: bool) -> Self {
        let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::new(NodeExecutorRegistry::core(), concurrency, dev_mode)
    }

    pub fn registry(&self) -> &Arc<NodeExecutorRegistry> {
        &self.registry
    }

    /// Structural validation alone (spec §4.5 step 1), exposed separately
    /// from `submit` so callers can pre-check a workflow without creating
    /// an execution. Idempotent and total-functional (spec §8).
    pub fn validate(&self, workflow: &Workflow) -> Result<(), EngineError> {
        workflow.validate().map_err(EngineError::from)
    }

    fn next_id(&self) -> String {
        self.next_execution_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// `submit(workflow, triggerInput, opts) -> executionId` (spec §6).
    /// Validates the graph and selects the trigger synchronously; a
    /// `ValidationError` here creates no execution record, matching the
    /// Engine API table's Failure column (see `DESIGN.md` for the
    /// resolution of this against spec §4.5 step 1's alternate wording).
    pub fn submit(
        &self,
        workflow: Workflow,
        trigger_input: NodeMap,
        opts: SubmitOptions,
    ) -> Result<String, EngineError> {
        workflow.validate()?;
        let trigger = workflow.select_trigger(opts.trigger_type)?.clone();

        let execution_id = self.next_id();
        let workflow = Arc::new(workflow);
        let execution = Arc::new(Mutex::new(Execution::new(
            execution_id.clone(),
            workflow.id.clone(),
            opts.trigger_type,
            trigger_input.clone(),
        )));
        let (status_tx, status_rx) = tokio::sync::watch::channel(ExecutionStatus::Running);

        let ctx = ExecutionContext::new(
            execution_id.clone(),
            workflow.clone(),
            trigger_input,
            self.dev_mode,
            opts.step_mode,
            self.scheduler.clone(),
        );

        if opts.dry_run {
            // Pre-run validation request: no node is dispatched, the
            // execution is recorded terminal immediately (spec §4.5 step 1).
            execution.lock().finish(ExecutionStatus::Success, Some(NodeMap::new()), None);
            let _ = status_tx.send(ExecutionStatus::Success);
            self.executions.insert(
                execution_id.clone(),
                ExecutionHandle { execution, ctx, status_rx },
            );
            return Ok(execution_id);
        }

        self.executions.insert(
            execution_id.clone(),
            ExecutionHandle {
                execution: execution.clone(),
                ctx: ctx.clone(),
                status_rx,
            },
        );

        let scheduler = self.scheduler.clone();
        let timeout = opts.timeout;
        tokio::spawn(async move {
            let outcome = if let Some(dur) = timeout {
                let watchdog_ctx = ctx.clone();
                let watchdog = tokio::spawn(async move {
                    tokio::time::sleep(dur).await;
                    watchdog_ctx.cancel_for_timeout();
                });
                let outcome = scheduler.run_workflow(&ctx, &trigger).await;
                watchdog.abort();
                outcome
            } else {
                scheduler.run_workflow(&ctx, &trigger).await
            };

            let node_executions = ctx.node_executions_snapshot();
            let (status, error_message) = match outcome.status {
                GraphStatus::Success => (ExecutionStatus::Success, None),
                GraphStatus::Cancelled if ctx.is_timed_out() => (
                    ExecutionStatus::Failed,
                    Some(
                        outcome
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| format!("{:?}: execution exceeded timeout", NodeErrorKind::Timeout)),
                    ),
                ),
                GraphStatus::Cancelled => (ExecutionStatus::Cancelled, None),
                GraphStatus::Failed => (
                    ExecutionStatus::Failed,
                    Some(
                        outcome
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "node execution failed".to_string()),
                    ),
                ),
            };

            {
                let mut exec = execution.lock();
                exec.node_executions = node_executions;
                exec.finish(status, Some(outcome.output), error_message);
            }
            let _ = status_tx.send(status);
        });

        Ok(execution_id)
    }

    fn handle(&self, execution_id: &str) -> Result<ExecutionHandle, EngineError> {
        self.executions
            .get(execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// `await(executionId) -> Execution` (spec §6): blocks until the
    /// execution reaches a terminal status.
    pub async fn await_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        let mut handle = self.handle(execution_id)?;
        loop {
            if handle.status_rx.borrow().is_terminal() {
                return Ok(handle.execution.lock().clone());
            }
            if handle.status_rx.changed().await.is_err() {
                return Ok(handle.execution.lock().clone());
            }
        }
    }

    pub fn get_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        Ok(self.handle(execution_id)?.execution.lock().clone())
    }

    /// `cancel(executionId)` (spec §6): no-op if already terminal.
    pub fn cancel(&self, execution_id: &str) -> Result<(), EngineError> {
        let handle = self.handle(execution_id)?;
        if handle.execution.lock().status.is_terminal() {
            return Ok(());
        }
        handle.ctx.cancel();
        Ok(())
    }

    /// `step.continue(executionId)` (spec §6): fails `NotPaused` unless the
    /// execution is actually awaiting a step gate.
    pub fn step_continue(&self, execution_id: &str) -> Result<(), EngineError> {
        let handle = self.handle(execution_id)?;
        if !handle.ctx.is_paused() {
            return Err(EngineError::NotPaused(execution_id.to_string()));
        }
        handle.ctx.step_continue();
        Ok(())
    }

    /// `step.reset(executionId)` (spec §6): clears pause state regardless of
    /// whether the execution is currently paused.
    pub fn step_reset(&self, execution_id: &str) -> Result<(), EngineError> {
        let handle = self.handle(execution_id)?;
        handle.ctx.step_reset();
        Ok(())
    }

    /// Dev-mode debug-bundle export (spec §4.7). `None` when dev mode was
    /// never enabled for this execution.
    pub fn debug_bundle(&self, execution_id: &str) -> Result<Option<DebugBundle>, EngineError> {
        let handle = self.handle(execution_id)?;
        Ok(handle
            .ctx
            .inspector()
            .map(|inspector| inspector.debug_bundle(&handle.ctx.workflow, execution_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_workflow::{Connection, Node};

    fn trigger() -> Node {
        Node::new("manualTrigger", "Trigger").with_id("trigger")
    }

    #[tokio::test]
    async fn submit_and_await_success_runs_a_trivial_workflow() {
        let engine = Engine::core(false);
        let mut wf = Workflow::new("t");
        let t = trigger();
        let noop = Node::new("noOp", "NoOp").with_id("n1");
        wf.nodes = vec![t, noop];
        wf.connections = vec![Connection::main("trigger", "n1")];

        let mut input = NodeMap::new();
        input.insert("x".to_string(), serde_json::json!(1));

        let id = engine.submit(wf, input, SubmitOptions::default()).unwrap();
        let exec = engine.await_execution(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.output_data.unwrap().get("x"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn submit_rejects_invalid_workflow_without_recording_execution() {
        let engine = Engine::core(false);
        let wf = Workflow::new("no-trigger");
        let result = engine.submit(wf, NodeMap::new(), SubmitOptions::default());
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn dry_run_validates_without_dispatching_nodes() {
        let engine = Engine::core(false);
        let mut wf = Workflow::new("t");
        wf.nodes = vec![trigger()];
        let id = engine
            .submit(
                wf,
                NodeMap::new(),
                SubmitOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let exec = engine.await_execution(&id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert!(exec.node_executions.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_once_terminal() {
        let engine = Engine::core(false);
        let mut wf = Workflow::new("t");
        wf.nodes = vec![trigger()];
        let id = engine.submit(wf, NodeMap::new(), SubmitOptions::default()).unwrap();
        engine.await_execution(&id).await.unwrap();
        assert!(engine.cancel(&id).is_ok());
    }
}
