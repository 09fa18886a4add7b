//! Execution and per-node execution record types (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::NodeMap;
use crate::workflow::TriggerType;

/// Terminal or in-flight status of an `Execution`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Per-node status, tracked by the scheduler's dispatch loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

/// One record per node dispatch. A `merge` node may accumulate more than one
/// record per execution, one per arriving branch (spec §4.5 "Fan-in via
/// merge").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub input: NodeMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionRecord {
    pub fn started(node_id: &str, name: &str, node_type: &str, input: NodeMap) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: name.to_string(),
            node_type: node_type.to_string(),
            status: NodeStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            input,
            output: None,
            error: None,
        }
    }

    pub fn finish_success(&mut self, output: NodeMap) {
        self.status = NodeStatus::Success;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_error(&mut self, status: NodeStatus, error: String) {
        self.status = status;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

/// A single run of a `Workflow` to completion (spec §3 "Execution").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_type: TriggerType,
    pub input_data: NodeMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data: Option<NodeMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub node_executions: Vec<NodeExecutionRecord>,
}

impl Execution {
    pub fn new(id: String, workflow_id: String, trigger_type: TriggerType, input_data: NodeMap) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            trigger_type,
            input_data,
            output_data: None,
            error_message: None,
            node_executions: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus, output_data: Option<NodeMap>, error_message: Option<String>) {
        self.status = status;
        self.output_data = output_data;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
    }
}
