//! Dev-mode inspector (spec §4.7, component C7) - optional, toggled by
//! configuration. Step execution itself lives on `ExecutionContext`
//! (`await_step`/`step_continue`/`step_reset`); this module owns the
//! timing table, event log, and debug-bundle assembly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::context::LogEvent;

#[derive(Debug, Clone, Serialize)]
pub struct NodeTiming {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
}

/// HTTP request/response pairs issued by library executors (e.g. an HTTP
/// request node), surfaced for post-mortem. The core never issues these
/// itself - it only carries the log for whoever does.
#[derive(Debug, Clone, Serialize)]
pub struct HttpLogEntry {
    pub node_id: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub at: DateTime<Utc>,
}

pub struct Inspector {
    timings: Mutex<Vec<NodeTiming>>,
    events: Mutex<Vec<LogEvent>>,
    http_log: Mutex<Vec<HttpLogEntry>>,
}

impl Inspector {
    pub fn new() -> Self {
        Self {
            timings: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            http_log: Mutex::new(Vec::new()),
        }
    }

    pub fn start_node(&self, node_id: &str) {
        self.timings.lock().push(NodeTiming {
            node_id: node_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            success: None,
            error_message: None,
        });
    }

    pub fn finish_node(&self, node_id: &str, success: bool, error_message: Option<String>) {
        let mut timings = self.timings.lock();
        if let Some(entry) = timings.iter_mut().rev().find(|t| t.node_id == node_id && t.finished_at.is_none()) {
            let now = Utc::now();
            entry.finished_at = Some(now);
            entry.duration_ms = Some((now - entry.started_at).num_milliseconds());
            entry.success = Some(success);
            entry.error_message = error_message;
        }
    }

    pub fn push_event(&self, event: LogEvent) {
        self.events.lock().push(event);
    }

    pub fn log_http(&self, entry: HttpLogEntry) {
        self.http_log.lock().push(entry);
    }

    pub fn timings(&self) -> Vec<NodeTiming> {
        self.timings.lock().clone()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn http_log(&self) -> Vec<HttpLogEntry> {
        self.http_log.lock().clone()
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

/// A structured snapshot for post-mortem debugging: workflow definition,
/// event log, per-node timings, HTTP logs, and redacted settings.
#[derive(Debug, Clone, Serialize)]
pub struct DebugBundle {
    pub workflow_id: String,
    pub execution_id: String,
    pub workflow: flow_workflow::Workflow,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub events: Vec<LogEvent>,
    pub timings: Vec<NodeTiming>,
    pub http_log: Vec<HttpLogEntry>,
}

/// Keys commonly carrying secrets; redacted before the bundle leaves the
/// engine.
const REDACTED_SETTINGS_KEYS: &[&str] = &["apikey", "token", "secret", "password", "credential"];

pub fn redact_settings(settings: &serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    settings
        .iter()
        .map(|(k, v)| {
            let lower = k.to_lowercase();
            if REDACTED_SETTINGS_KEYS.iter().any(|needle| lower.contains(needle)) {
                (k.clone(), serde_json::Value::String("<redacted>".to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

impl Inspector {
    /// Assembles the structured post-mortem snapshot (spec §4.7).
    pub fn debug_bundle(&self, workflow: &flow_workflow::Workflow, execution_id: &str) -> DebugBundle {
        DebugBundle {
            workflow_id: workflow.id.clone(),
            execution_id: execution_id.to_string(),
            workflow: workflow.clone(),
            settings: redact_settings(&workflow.settings),
            events: self.events(),
            timings: self.timings(),
            http_log: self.http_log(),
        }
    }
}
