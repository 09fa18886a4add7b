//! The immutable workflow graph and its structural validation.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::WorkflowError;
use crate::node::Node;
use crate::value::NodeMap;

/// How an execution was started. Persisted format enum (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerType {
    #[default]
    Manual,
    Schedule,
    Webhook,
    File,
}

/// An immutable directed graph of nodes wired by connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: NodeMap,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            settings: NodeMap::new(),
            nodes: Vec::new(),
            connections: Vec::new(),
            active: false,
            trigger_type: TriggerType::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_by_id(&self) -> HashMap<&str, &Node> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    pub fn trigger_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_trigger()).collect()
    }

    /// Outgoing connections from `(node_id, handle)`, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &str, handle: &str) -> Vec<&'a Connection> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id && c.source_handle_id == handle)
            .collect()
    }

    /// All outgoing connections from a node regardless of handle.
    pub fn outgoing_all<'a>(&'a self, node_id: &str) -> Vec<&'a Connection> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .collect()
    }

    /// Incoming connections to `node_id`, in declaration order.
    pub fn incoming<'a>(&'a self, node_id: &str) -> Vec<&'a Connection> {
        self.connections
            .iter()
            .filter(|c| c.target_node_id == node_id)
            .collect()
    }

    pub fn is_leaf(&self, node_id: &str) -> bool {
        !self.connections.iter().any(|c| c.source_node_id == node_id)
    }

    /// Nodes reachable from the given trigger, i.e. the set that will
    /// actually be dispatched. Islands (unreferenced nodes) are not
    /// executed (spec §3 invariants).
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(start.to_string());
        queue.push_back(start.to_string());
        while let Some(id) = queue.pop_front() {
            for conn in self.outgoing_all(&id) {
                if seen.insert(conn.target_node_id.clone()) {
                    queue.push_back(conn.target_node_id.clone());
                }
            }
        }
        seen
    }

    /// Structural validation (spec §4.5 step 1 / §7 `ValidationError`):
    /// every connection endpoint resolves, node ids are unique, exactly one
    /// trigger participates in a given execution, and the graph has no
    /// cycle outside of a `loop` node's body.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
            }
        }

        let by_id = self.nodes_by_id();
        for conn in &self.connections {
            if !by_id.contains_key(conn.source_node_id.as_str()) {
                return Err(WorkflowError::UnknownConnectionEndpoint {
                    connection_id: conn.id.clone(),
                    node_id: conn.source_node_id.clone(),
                });
            }
            if !by_id.contains_key(conn.target_node_id.as_str()) {
                return Err(WorkflowError::UnknownConnectionEndpoint {
                    connection_id: conn.id.clone(),
                    node_id: conn.target_node_id.clone(),
                });
            }
        }

        if self.trigger_nodes().is_empty() {
            return Err(WorkflowError::NoTrigger);
        }

        self.check_cycles(&by_id)?;

        Ok(())
    }

    /// Matches the trigger node for a requested trigger type, falling back
    /// to the sole trigger node when there's exactly one (the common case
    /// for a manually-submitted execution).
    pub fn select_trigger(&self, trigger_type: TriggerType) -> Result<&Node, WorkflowError> {
        let triggers = self.trigger_nodes();
        if triggers.is_empty() {
            return Err(WorkflowError::NoTrigger);
        }
        if triggers.len() == 1 {
            return Ok(triggers[0]);
        }
        let want = format!("{:?}Trigger", trigger_type).to_lowercase();
        triggers
            .into_iter()
            .find(|n| n.node_type.to_lowercase() == want)
            .ok_or(WorkflowError::AmbiguousTrigger)
    }

    /// DFS cycle detection. A back-edge into a node reachable only via a
    /// `loop` node's `body` handle is permitted (spec §4.3 `loop`, §9
    /// "Graph cycles"); any other back-edge is an illegal cycle.
    fn check_cycles(&self, by_id: &HashMap<&str, &Node>) -> Result<(), WorkflowError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            workflow: &'a Workflow,
            by_id: &HashMap<&str, &'a Node>,
            node_id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), WorkflowError> {
            match marks.get(node_id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(WorkflowError::IllegalCycle(node_id.to_string()))
                }
                None => {}
            }
            marks.insert(node_id, Mark::Visiting);
            for conn in workflow.outgoing_all(node_id) {
                let target_is_visiting_loop = by_id
                    .get(conn.target_node_id.as_str())
                    .map(|n| n.node_type == "loop")
                    .unwrap_or(false)
                    && marks.get(conn.target_node_id.as_str()) == Some(&Mark::Visiting);
                // An edge closing the cycle back into a `loop` node still on
                // the stack is the body subgraph's own bounded re-entry, not
                // an illegal cycle.
                if target_is_visiting_loop {
                    continue;
                }
                visit(workflow, by_id, &conn.target_node_id, marks)?;
            }
            marks.insert(node_id, Mark::Done);
            Ok(())
        }

        for node in &self.nodes {
            visit(self, by_id, &node.id, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn wf_with(nodes: Vec<Node>, connections: Vec<Connection>) -> Workflow {
        let mut wf = Workflow::new("test");
        wf.nodes = nodes;
        wf.connections = connections;
        wf
    }

    #[test]
    fn requires_a_trigger() {
        let n = Node::new("set", "Set").with_id("n1");
        let wf = wf_with(vec![n], vec![]);
        assert_eq!(wf.validate(), Err(WorkflowError::NoTrigger));
    }

    #[test]
    fn detects_plain_cycles() {
        let a = Node::new("manualTrigger", "Trigger").with_id("a");
        let b = Node::new("set", "B").with_id("b");
        let c = Node::new("set", "C").with_id("c");
        let wf = wf_with(
            vec![a, b, c],
            vec![
                Connection::main("a", "b"),
                Connection::main("b", "c"),
                Connection::main("c", "b"),
            ],
        );
        assert!(matches!(wf.validate(), Err(WorkflowError::IllegalCycle(_))));
    }

    #[test]
    fn allows_cycles_mediated_by_loop_body_handle() {
        let a = Node::new("manualTrigger", "Trigger").with_id("a");
        let l = Node::new("loop", "Loop").with_id("l");
        let body = Node::new("set", "Body").with_id("body");
        let wf = wf_with(
            vec![a, l, body],
            vec![
                Connection::main("a", "l"),
                Connection::new("l", crate::connection::HANDLE_BODY, "body", "main"),
                Connection::main("body", "l"),
            ],
        );
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn unreferenced_islands_are_allowed() {
        let a = Node::new("manualTrigger", "Trigger").with_id("a");
        let island = Node::new("set", "Island").with_id("island");
        let wf = wf_with(vec![a, island], vec![]);
        assert!(wf.validate().is_ok());
    }
}
