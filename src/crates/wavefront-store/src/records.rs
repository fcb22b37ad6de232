//! Durable coordination records: suspensions, merges, loops, pins, and
//! error-workflow configuration.
//!
//! These are the records the runtime's coordinators own. Each is keyed by the
//! run it belongs to (plus a node id where relevant) and survives process
//! restarts through the [`StateStore`](crate::StateStore).

use crate::state::{NodeId, RunId, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Suspensions
// ---------------------------------------------------------------------------

/// The kind of wait a suspension represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Timer,
    Datetime,
    Webhook,
    Approval,
    Subworkflow,
    Condition,
}

/// What to do when a suspension's timeout elapses before it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Fail the run.
    Error,
    /// Resume with an empty payload.
    Continue,
    /// Resume with the configured default payload.
    Default,
}

/// Lifecycle of a suspension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionStatus {
    Pending,
    Resolved,
    Cancelled,
}

/// A durable pause point. Holds the full state snapshot needed to rehydrate
/// the run, plus whatever the wait kind needs to fire: a deadline, a webhook
/// route, an approval correlation id, or a child run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionRecord {
    pub id: String,
    pub run_id: RunId,
    pub workflow_id: String,
    pub node_id: NodeId,
    pub kind: WaitKind,

    /// When a timer/datetime wait fires, or when a condition wait next polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Route suffix a webhook wait listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,
    /// Shared secret a webhook delivery must present in `x-wait-token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<String>,
    /// Remote addresses allowed to deliver the webhook. Empty means any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    /// Templated response body returned to the webhook caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
    /// Correlation id an approval service resolves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Run id of the child spawned by an `executeWorkflow` node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<RunId>,
    /// Workflow the child run executes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_workflow_id: Option<String>,
    /// Input handed to the child run's trigger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_input: Option<serde_json::Value>,
    /// Boolean expression a condition wait re-evaluates each scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// How far `resume_at` advances between condition re-evaluations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    pub timeout_at: DateTime<Utc>,
    pub on_timeout: TimeoutAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_payload: Option<serde_json::Value>,

    /// Full run-state snapshot captured at suspend time.
    pub stored_state: RunState,
    /// Nodes still pending downstream of the suspended node.
    #[serde(default)]
    pub pending_node_ids: Vec<NodeId>,

    pub status: SuspensionStatus,
    /// The payload the suspension resolved with. Kept so duplicate resume
    /// attempts return the original resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SuspensionRecord {
    /// Checks that exactly the field matching `kind` is populated:
    /// `resume_at` for timer/datetime/condition, `webhook_path` for webhook,
    /// `correlation_id` for approval, `child_run_id` for subworkflow.
    pub fn validate(&self) -> Result<(), String> {
        let (wants_resume_at, wants_webhook, wants_correlation, wants_child) = match self.kind {
            WaitKind::Timer | WaitKind::Datetime | WaitKind::Condition => (true, false, false, false),
            WaitKind::Webhook => (false, true, false, false),
            WaitKind::Approval => (false, false, true, false),
            WaitKind::Subworkflow => (false, false, false, true),
        };
        let checks = [
            (wants_resume_at, self.resume_at.is_some(), "resumeAt"),
            (wants_webhook, self.webhook_path.is_some(), "webhookPath"),
            (wants_correlation, self.correlation_id.is_some(), "correlationId"),
            (wants_child, self.child_run_id.is_some(), "childRunId"),
        ];
        for (wanted, present, field) in checks {
            if wanted && !present {
                return Err(format!("{:?} suspension requires {}", self.kind, field));
            }
            if !wanted && present {
                return Err(format!("{:?} suspension must not set {}", self.kind, field));
            }
        }
        Ok(())
    }

    /// Whether this suspension is scanned by the resumption worker rather
    /// than resolved by an external event.
    pub fn is_poll_driven(&self) -> bool {
        matches!(
            self.kind,
            WaitKind::Timer | WaitKind::Datetime | WaitKind::Condition
        )
    }
}

// ---------------------------------------------------------------------------
// Merges
// ---------------------------------------------------------------------------

/// How many branches a merge waits for before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    WaitAll,
    WaitAny,
    WaitN,
}

/// How branch outputs are combined into the merged output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    #[default]
    Append,
    Join,
    PassThrough,
    DeepMerge,
    KeyedMerge,
}

/// Conflict resolution for `deep_merge` when both sides hold a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    First,
    #[default]
    Last,
    /// Conflicting primitives are collected into an array.
    Merge,
}

/// One branch's completion event recorded at the merge point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchArrival {
    pub node_id: NodeId,
    pub items: Vec<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Synchronization state for one merge node within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    pub run_id: RunId,
    pub merge_node_id: NodeId,
    pub strategy: MergeStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_n: Option<usize>,
    pub data_mode: DataMode,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    pub expected_branches: usize,
    #[serde(default)]
    pub branch_data: HashMap<String, BranchArrival>,
    /// Branch ids in arrival order; canonical ordering for `append` and
    /// `deep_merge`.
    #[serde(default)]
    pub branch_order: Vec<String>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_output: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl MergeRecord {
    /// Number of arrivals required for the completion predicate.
    pub fn required(&self) -> usize {
        match self.strategy {
            MergeStrategy::WaitAll => self.expected_branches,
            MergeStrategy::WaitAny => 1,
            MergeStrategy::WaitN => self
                .wait_n
                .unwrap_or(self.expected_branches)
                .min(self.expected_branches),
        }
    }

    /// Whether enough branches have arrived.
    pub fn predicate_met(&self) -> bool {
        self.branch_data.len() >= self.required().max(1)
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Variables exposed inside one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    pub run_index: usize,
    pub batch_index: usize,
    pub item_index: usize,
    pub batch_size: usize,
    pub total_items: usize,
    pub is_last_batch: bool,
    pub loop_node_id: NodeId,
}

/// Iteration state for one loop node within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRecord {
    pub run_id: RunId,
    pub loop_node_id: NodeId,
    /// Nodes participating in one iteration.
    pub scope: HashSet<NodeId>,
    /// Scope nodes whose outputs feed back into the loop node.
    pub feedback_node_ids: HashSet<NodeId>,
    /// Innermost context last; nested loops stack.
    #[serde(default)]
    pub context_stack: Vec<LoopContext>,
    /// Outputs captured from feedback nodes, one entry per emission.
    #[serde(default)]
    pub aggregated: Vec<serde_json::Value>,
    /// The full input item list the loop batches over.
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Pinned data
// ---------------------------------------------------------------------------

/// When a pin substitutes for real node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    Always,
    OnError,
    Development,
    Disabled,
}

/// Developer-supplied static output for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedData {
    pub id: String,
    pub workflow_id: String,
    pub node_id: NodeId,
    pub user_id: String,
    pub mode: PinMode,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

// ---------------------------------------------------------------------------
// Error workflows
// ---------------------------------------------------------------------------

/// Failure severity used to match error-workflow configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

/// Binds a primary workflow to a compensating workflow spawned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorWorkflowConfig {
    /// The primary workflow this config watches.
    pub workflow_id: String,
    /// The workflow spawned when a matching failure occurs.
    pub error_workflow_id: String,
    /// Match only failures originating from these node types. Empty matches all.
    #[serde(default)]
    pub node_types: Vec<String>,
    /// Match only these error codes. Empty matches all.
    #[serde(default)]
    pub error_codes: Vec<String>,
    /// Minimum severity that triggers this config.
    #[serde(default)]
    pub min_severity: Severity,
}

impl ErrorWorkflowConfig {
    /// Whether a failure with the given attributes triggers this config.
    pub fn matches(&self, node_type: Option<&str>, error_code: &str, severity: Severity) -> bool {
        if severity < self.min_severity {
            return false;
        }
        if !self.node_types.is_empty() {
            match node_type {
                Some(t) if self.node_types.iter().any(|n| n == t) => {}
                _ => return false,
            }
        }
        if !self.error_codes.is_empty() && !self.error_codes.iter().any(|c| c == error_code) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GlobalContext, TriggerInfo};
    use serde_json::json;

    fn snapshot() -> RunState {
        RunState::new(GlobalContext::default(), TriggerInfo::manual(json!({})))
    }

    fn timer_record() -> SuspensionRecord {
        SuspensionRecord {
            id: "s1".into(),
            run_id: "r1".into(),
            workflow_id: "w1".into(),
            node_id: "wait".into(),
            kind: WaitKind::Timer,
            resume_at: Some(Utc::now()),
            webhook_path: None,
            secret_token: None,
            allowed_ips: None,
            response_body: None,
            correlation_id: None,
            child_run_id: None,
            child_workflow_id: None,
            child_input: None,
            condition: None,
            poll_interval_ms: None,
            timeout_at: Utc::now(),
            on_timeout: TimeoutAction::Error,
            default_payload: None,
            stored_state: snapshot(),
            pending_node_ids: vec![],
            status: SuspensionStatus::Pending,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn suspension_validation_enforces_exclusive_fields() {
        let rec = timer_record();
        assert!(rec.validate().is_ok());

        let mut both = timer_record();
        both.webhook_path = Some("/cb".into());
        assert!(both.validate().is_err());

        let mut webhook = timer_record();
        webhook.kind = WaitKind::Webhook;
        webhook.resume_at = None;
        webhook.webhook_path = Some("/cb".into());
        assert!(webhook.validate().is_ok());

        let mut missing = timer_record();
        missing.resume_at = None;
        assert!(missing.validate().is_err());
    }

    #[test]
    fn merge_required_counts() {
        let mut rec = MergeRecord {
            run_id: "r1".into(),
            merge_node_id: "m".into(),
            strategy: MergeStrategy::WaitAll,
            wait_n: None,
            data_mode: DataMode::Append,
            conflict_policy: ConflictPolicy::default(),
            key_field: None,
            expected_branches: 3,
            branch_data: HashMap::new(),
            branch_order: vec![],
            completed: false,
            merged_output: None,
            timeout_at: None,
        };
        assert_eq!(rec.required(), 3);

        rec.strategy = MergeStrategy::WaitAny;
        assert_eq!(rec.required(), 1);

        rec.strategy = MergeStrategy::WaitN;
        rec.wait_n = Some(2);
        assert_eq!(rec.required(), 2);

        // waitN larger than the branch count clamps.
        rec.wait_n = Some(10);
        assert_eq!(rec.required(), 3);
    }

    #[test]
    fn error_workflow_matching() {
        let config = ErrorWorkflowConfig {
            workflow_id: "w1".into(),
            error_workflow_id: "w2".into(),
            node_types: vec!["http".into()],
            error_codes: vec![],
            min_severity: Severity::Error,
        };
        assert!(config.matches(Some("http"), "ExecutorError", Severity::Error));
        assert!(!config.matches(Some("llm"), "ExecutorError", Severity::Error));
        assert!(!config.matches(Some("http"), "ExecutorError", Severity::Warning));

        let broad = ErrorWorkflowConfig {
            workflow_id: "w1".into(),
            error_workflow_id: "w2".into(),
            node_types: vec![],
            error_codes: vec![],
            min_severity: Severity::default(),
        };
        assert!(broad.matches(None, "anything", Severity::Critical));
    }
}
