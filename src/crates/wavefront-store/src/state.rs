//! Run-level execution state: the durable snapshot a run carries through
//! suspension and resumption.
//!
//! A [`Run`] owns a [`RunState`], which is the complete picture of one
//! execution: the immutable global context, the trigger that started it, the
//! per-node states, and a free-form variables map. The state is what gets
//! snapshotted into a suspension record and rehydrated on resume, so every
//! type here is serde-serializable.
//!
//! # Status machines
//!
//! ```text
//! Run:   pending → running → (completed | failed | cancelled | timeout)
//!                      ↕
//!                  suspended
//!
//! Node:  pending → running → (completed | error | skipped
//!                             | suspended | waitingForMerge)
//!        suspended / waitingForMerge may return to running exactly once.
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node identifier, unique within a workflow graph.
pub type NodeId = String;

/// Run identifier, unique across all executions.
pub type RunId = String;

/// Terminal and intermediate statuses for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    /// Whether this status is terminal. Terminal runs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout
        )
    }
}

/// Per-node execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
    Suspended,
    WaitingForMerge,
}

impl NodeStatus {
    /// Whether the node has finished for scheduling purposes.
    ///
    /// `suspended` and `waitingForMerge` are parked, not terminated: the node
    /// will return to `running` once before settling.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Error | NodeStatus::Skipped
        )
    }

    /// Validates the monotonic status transition rules.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed | Error | Skipped | Suspended | WaitingForMerge) => true,
            // Parked states resume exactly once.
            (Suspended, Running) => true,
            (WaitingForMerge, Running) => true,
            (WaitingForMerge, Completed) => true,
            _ => false,
        }
    }
}

/// The kind of trigger that started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Scheduled,
    Api,
    Event,
    Error,
}

/// The trigger that produced a run's initial state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// What fired the workflow.
    pub kind: TriggerKind,
    /// Arbitrary payload delivered by the trigger.
    pub payload: serde_json::Value,
    /// When the trigger fired.
    pub timestamp: DateTime<Utc>,
}

impl TriggerInfo {
    pub fn new(kind: TriggerKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A manual trigger carrying the given payload.
    pub fn manual(payload: serde_json::Value) -> Self {
        Self::new(TriggerKind::Manual, payload)
    }
}

/// Immutable global context, fixed at run creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContext {
    pub user_id: String,
    pub workspace_id: String,
    pub env: String,
    pub started_at: DateTime<Utc>,
    pub is_test: bool,
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            workspace_id: String::new(),
            env: "production".to_string(),
            started_at: Utc::now(),
            is_test: false,
        }
    }
}

/// Execution metadata attached to a node's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub used_pinned_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Output port this node's result left through (`true`/`false` for
    /// conditions, `done` for loops). Downstream edge selection reads this,
    /// so it is persisted with the node state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl NodeMeta {
    /// Fresh metadata for a node that just started running.
    pub fn running() -> Self {
        Self {
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            error: None,
            used_pinned_data: false,
            pin_id: None,
            retry_count: 0,
            output_path: None,
        }
    }

    /// Settle into a terminal-ish status, stamping completion time.
    pub fn settle(&mut self, status: NodeStatus) {
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        self.completed_at = Some(now);
        self.status = status;
    }
}

/// The recorded state of one node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// The node's committed output, visible to downstream nodes.
    pub output: serde_json::Value,
    /// Execution metadata.
    pub meta: NodeMeta,
}

impl NodeState {
    pub fn skipped() -> Self {
        Self {
            output: serde_json::Value::Null,
            meta: NodeMeta {
                status: NodeStatus::Skipped,
                started_at: None,
                completed_at: Some(Utc::now()),
                duration_ms: None,
                error: None,
                used_pinned_data: false,
                pin_id: None,
                retry_count: 0,
                output_path: None,
            },
        }
    }
}

/// Mutable per-run execution state. This is the snapshot unit: suspensions
/// store a full `RunState`, and resume rehydrates from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub global: GlobalContext,
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub nodes: HashMap<NodeId, NodeState>,
    /// Free-form scratch map, writable by any node.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

impl RunState {
    pub fn new(global: GlobalContext, trigger: TriggerInfo) -> Self {
        Self {
            global,
            trigger,
            nodes: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    /// Committed output of a node, if it has one.
    pub fn node_output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.nodes.get(node_id).map(|n| &n.output)
    }

    /// Status of a node, `pending` if it has no recorded state yet.
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.nodes
            .get(node_id)
            .map(|n| n.meta.status)
            .unwrap_or(NodeStatus::Pending)
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured entry in a run's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionLogEntry {
    pub fn new(level: LogLevel, node_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            node_id,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Top-level failure attached to a terminal run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl RunError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub workflow_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub state: RunState,
    #[serde(default)]
    pub logs: Vec<ExecutionLogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Wall-clock milliseconds spent actively executing. Time spent suspended
    /// does not accumulate here, so run-level timeouts ignore long waits.
    #[serde(default)]
    pub active_ms: u64,
}

impl Run {
    pub fn new(id: RunId, workflow_id: impl Into<String>, state: RunState) -> Self {
        Self {
            id,
            workflow_id: workflow_id.into(),
            user_id: state.global.user_id.clone(),
            status: RunStatus::Pending,
            started_at: state.global.started_at,
            state,
            logs: Vec::new(),
            completed_at: None,
            error: None,
            active_ms: 0,
        }
    }
}
