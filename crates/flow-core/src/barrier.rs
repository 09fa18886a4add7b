//! The `merge` fan-in barrier (spec §4.3 `merge`) - the hardest control node.
//!
//! A barrier instance is keyed by `(executionId, node.id)` and lives inside
//! [`crate::context::ExecutionContext`]. The first arriving branch creates
//! it; later branches attach via [`Barrier::arrive`]. Bookkeeping uses a
//! short `parking_lot::Mutex` critical section (never held across an
//! `.await`) plus a `tokio::sync::Notify` for wake-up, the classic
//! mutex+condvar pattern translated to async.

use std::time::Duration;

use flow_workflow::value::{deep_overlay, shallow_overlay, Value};
use flow_workflow::NodeMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One of the five fan-in join modes (spec §4.3 `merge`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeMode {
    WaitAll,
    WaitAny,
    Append,
    Merge,
    PassThrough,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMode::WaitAll => "waitAll",
            MergeMode::WaitAny => "waitAny",
            MergeMode::Append => "append",
            MergeMode::Merge => "merge",
            MergeMode::PassThrough => "passThrough",
        }
    }

    /// Modes that wait for every arrival before releasing anyone (as
    /// opposed to `waitAny`, which releases the first arrival immediately).
    fn blocks_until_full(&self) -> bool {
        !matches!(self, MergeMode::WaitAny)
    }
}

/// The declarative shape of a merge node's parameters. Every caller of
/// [`crate::context::ExecutionContext::get_barrier`] for the same node must
/// supply an equal spec - divergence is an `InternalInconsistency` (spec
/// §4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSpec {
    pub mode: MergeMode,
    pub input_count: usize,
    pub timeout: Option<Duration>,
    pub output_key: String,
    pub wait_for_all: bool,
}

impl Default for MergeSpec {
    fn default() -> Self {
        Self {
            mode: MergeMode::WaitAll,
            input_count: 1,
            timeout: None,
            output_key: "merged".to_string(),
            wait_for_all: true,
        }
    }
}

/// What an arrival should do: proceed downstream with a payload, or be
/// suppressed (downstream pruned).
#[derive(Debug, Clone)]
pub enum BarrierOutcome {
    Proceed(NodeMap),
    Suppressed(NodeMap),
}

struct BarrierState {
    arrived: Vec<NodeMap>,
    released: bool,
    timed_out: bool,
    cancelled: bool,
    primary_index: Option<usize>,
    released_payload: Option<NodeMap>,
}

/// Per-`(executionId, nodeId)` coordination object tracking arrivals. The
/// only shared mutable object between branches (spec §5).
pub struct Barrier {
    pub spec: MergeSpec,
    state: Mutex<BarrierState>,
    notify: Notify,
}

impl Barrier {
    pub fn new(spec: MergeSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(BarrierState {
                arrived: Vec::new(),
                released: false,
                timed_out: false,
                cancelled: false,
                primary_index: None,
                released_payload: None,
            }),
            notify: Notify::new(),
        }
    }

    /// A branch arrives with its payload. Returns once this caller may
    /// proceed or has been determined suppressed.
    pub async fn arrive(&self, payload: NodeMap, cancellation: &CancellationToken) -> BarrierOutcome {
        if !self.spec.wait_for_all {
            return self.arrive_exclusive(payload);
        }
        match self.spec.mode {
            MergeMode::WaitAny => self.arrive_wait_any(payload),
            _ => self.arrive_blocking(payload, cancellation).await,
        }
    }

    /// Exclusive (`waitForAll=false`): first arrival proceeds regardless of
    /// mode, stamped `_exclusive=true,_inputsReceived=1`; later arrivals are
    /// ignored (spec §4.3, §9 Open Questions: "exclusive always wins").
    fn arrive_exclusive(&self, payload: NodeMap) -> BarrierOutcome {
        let mut state = self.state.lock();
        if state.released {
            return BarrierOutcome::Suppressed(stop_marker());
        }
        state.released = true;
        drop(state);
        let mut out = payload;
        out.insert("_mergeMode".to_string(), Value::String(self.spec.mode.as_str().to_string()));
        out.insert("_exclusive".to_string(), Value::Bool(true));
        out.insert("_inputsReceived".to_string(), Value::from(1));
        BarrierOutcome::Proceed(out)
    }

    /// `waitAny`: the first arrival returns immediately; later arrivals
    /// return their own payload too, but marked for downstream pruning.
    fn arrive_wait_any(&self, payload: NodeMap) -> BarrierOutcome {
        let mut state = self.state.lock();
        state.arrived.push(payload.clone());
        let idx = state.arrived.len();
        if idx == 1 {
            state.released = true;
            drop(state);
            let mut out = payload;
            out.insert("_mergeMode".to_string(), Value::String("waitAny".to_string()));
            out.insert("_inputsReceived".to_string(), Value::from(idx as i64));
            BarrierOutcome::Proceed(out)
        } else {
            drop(state);
            let mut out = payload;
            out.insert("_mergeMode".to_string(), Value::String("waitAny".to_string()));
            out.insert("_inputsReceived".to_string(), Value::from(idx as i64));
            out.insert("_stopExecution".to_string(), Value::Bool(true));
            BarrierOutcome::Suppressed(out)
        }
    }

    /// `waitAll` / `append` / `merge` / `passThrough`: block until
    /// `inputCount` arrivals, then release every caller together.
    async fn arrive_blocking(&self, payload: NodeMap, cancellation: &CancellationToken) -> BarrierOutcome {
        let my_index = {
            let mut state = self.state.lock();
            state.arrived.push(payload);
            let idx = state.arrived.len();
            if state.primary_index.is_none() {
                state.primary_index = Some(idx);
            }
            if idx >= self.spec.input_count && !state.released {
                let combined = self.compute_release(&state);
                state.released_payload = Some(combined);
                state.released = true;
                self.notify.notify_waiters();
            }
            idx
        };

        loop {
            // Register for the next notification *before* checking state,
            // not after - `Notify` only guarantees a `notified()` call
            // observes notifications sent after it was created, so
            // checking first would leave a window where a release between
            // the check and this call is silently missed (the waiter would
            // then block until timeout/cancellation instead of the
            // barrier's own release).
            let wait = self.notify.notified();
            {
                let state = self.state.lock();
                if state.released {
                    return self.finish_for(my_index, &state);
                }
                if state.cancelled {
                    return BarrierOutcome::Suppressed(cancelled_marker());
                }
            }
            tokio::select! {
                _ = wait => {}
                _ = cancellation.cancelled() => {
                    let mut state = self.state.lock();
                    if !state.released {
                        state.cancelled = true;
                        state.released = true;
                        self.notify.notify_waiters();
                    }
                }
                _ = sleep_or_pending(self.spec.timeout) => {
                    let mut state = self.state.lock();
                    if !state.released {
                        state.timed_out = true;
                        state.released = true;
                        self.notify.notify_waiters();
                    }
                }
            }
        }
    }

    fn compute_release(&self, state: &BarrierState) -> NodeMap {
        match self.spec.mode {
            MergeMode::WaitAll | MergeMode::Append => {
                let mut out = NodeMap::new();
                out.insert(
                    self.spec.output_key.clone(),
                    Value::Array(state.arrived.iter().map(|m| Value::Object(m.clone())).collect()),
                );
                out
            }
            MergeMode::Merge => {
                let mut acc = Value::Object(NodeMap::new());
                for payload in &state.arrived {
                    acc = deep_overlay(&acc, &Value::Object(payload.clone()));
                }
                let mut out = NodeMap::new();
                out.insert(self.spec.output_key.clone(), acc);
                out
            }
            MergeMode::PassThrough => {
                let mut acc = NodeMap::new();
                for payload in &state.arrived {
                    acc = shallow_overlay(&acc, payload);
                }
                acc
            }
            MergeMode::WaitAny => unreachable!("waitAny never blocks"),
        }
    }

    fn finish_for(&self, my_index: usize, state: &BarrierState) -> BarrierOutcome {
        if state.cancelled {
            return BarrierOutcome::Suppressed(cancelled_marker());
        }
        if state.timed_out {
            let mut out = NodeMap::new();
            out.insert("_mergeMode".to_string(), Value::String(self.spec.mode.as_str().to_string()));
            out.insert("_timedOut".to_string(), Value::Bool(true));
            if let MergeMode::WaitAll | MergeMode::Append | MergeMode::Merge = self.spec.mode {
                out.insert(
                    self.spec.output_key.clone(),
                    Value::Array(state.arrived.iter().map(|m| Value::Object(m.clone())).collect()),
                );
            }
            return BarrierOutcome::Proceed(out);
        }
        let combined = state
            .released_payload
            .clone()
            .unwrap_or_default();
        match self.spec.mode {
            MergeMode::PassThrough => {
                if Some(my_index) == state.primary_index {
                    let mut out = combined;
                    out.insert("_mergeMode".to_string(), Value::String("passThrough".to_string()));
                    BarrierOutcome::Proceed(out)
                } else {
                    BarrierOutcome::Suppressed(stop_marker())
                }
            }
            _ => {
                let mut out = combined;
                out.insert(
                    "_mergeMode".to_string(),
                    Value::String(self.spec.mode.as_str().to_string()),
                );
                BarrierOutcome::Proceed(out)
            }
        }
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

fn stop_marker() -> NodeMap {
    let mut m = NodeMap::new();
    m.insert("_stopExecution".to_string(), Value::Bool(true));
    m
}

fn cancelled_marker() -> NodeMap {
    let mut m = NodeMap::new();
    m.insert("_cancelled".to_string(), Value::Bool(true));
    m.insert("_stopExecution".to_string(), Value::Bool(true));
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn payload(v: i64) -> NodeMap {
        let mut m = NodeMap::new();
        m.insert("v".to_string(), Value::from(v));
        m
    }

    #[tokio::test]
    async fn wait_all_releases_every_caller_with_equal_payload() {
        let barrier = Arc::new(Barrier::new(MergeSpec {
            mode: MergeMode::WaitAll,
            input_count: 2,
            timeout: None,
            output_key: "merged".to_string(),
            wait_for_all: true,
        }));
        let token = CancellationToken::new();
        let b2 = barrier.clone();
        let t2 = token.clone();
        let first = tokio::spawn(async move { b2.arrive(payload(1), &t2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = barrier.arrive(payload(2), &token).await;
        let first = first.await.unwrap();
        match (first, second) {
            (BarrierOutcome::Proceed(a), BarrierOutcome::Proceed(b)) => assert_eq!(a, b),
            other => panic!("expected both to proceed with equal payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_any_suppresses_late_arrivals() {
        let barrier = Barrier::new(MergeSpec {
            mode: MergeMode::WaitAny,
            input_count: 2,
            timeout: None,
            output_key: "merged".to_string(),
            wait_for_all: true,
        });
        let token = CancellationToken::new();
        let first = barrier.arrive(payload(1), &token).await;
        let second = barrier.arrive(payload(2), &token).await;
        assert!(matches!(first, BarrierOutcome::Proceed(_)));
        match second {
            BarrierOutcome::Suppressed(m) => assert_eq!(m.get("_stopExecution"), Some(&Value::Bool(true))),
            other => panic!("expected suppressed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pass_through_releases_exactly_one_primary() {
        let barrier = Arc::new(Barrier::new(MergeSpec {
            mode: MergeMode::PassThrough,
            input_count: 2,
            timeout: None,
            output_key: "merged".to_string(),
            wait_for_all: true,
        }));
        let token = CancellationToken::new();
        let b2 = barrier.clone();
        let t2 = token.clone();
        let first = tokio::spawn(async move { b2.arrive(payload(1), &t2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = barrier.arrive(payload(2), &token).await;
        let first = first.await.unwrap();
        let proceeds = [&first, &second]
            .iter()
            .filter(|o| matches!(o, BarrierOutcome::Proceed(_)))
            .count();
        assert_eq!(proceeds, 1);
    }

    #[tokio::test]
    async fn exclusive_first_arrival_always_wins() {
        let barrier = Barrier::new(MergeSpec {
            mode: MergeMode::PassThrough,
            input_count: 2,
            timeout: None,
            output_key: "merged".to_string(),
            wait_for_all: false,
        });
        let token = CancellationToken::new();
        let outcome = barrier.arrive(payload(1), &token).await;
        match outcome {
            BarrierOutcome::Proceed(m) => {
                assert_eq!(m.get("_exclusive"), Some(&Value::Bool(true)));
                assert_eq!(m.get("_inputsReceived"), Some(&Value::from(1)));
            }
            other => panic!("expected proceed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_count_one_returns_immediately_in_every_mode() {
        for mode in [
            MergeMode::WaitAll,
            MergeMode::Append,
            MergeMode::Merge,
            MergeMode::PassThrough,
        ] {
            let barrier = Barrier::new(MergeSpec {
                mode,
                input_count: 1,
                timeout: None,
                output_key: "merged".to_string(),
                wait_for_all: true,
            });
            let token = CancellationToken::new();
            let outcome = barrier.arrive(payload(1), &token).await;
            assert!(matches!(outcome, BarrierOutcome::Proceed(_)), "mode {mode:?}");
        }
    }
}
