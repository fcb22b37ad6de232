//! The storage trait the runtime programs against.
//!
//! [`StateStore`] is the narrow repository surface every backend implements.
//! The runtime never touches a database directly: runs, node states,
//! suspensions, merge/loop records, pins, error-workflow configs, and
//! execution logs all flow through this trait. The crate ships an in-memory
//! reference implementation ([`InMemoryStateStore`](crate::InMemoryStateStore));
//! production deployments put a relational store behind the same interface.
//!
//! # Ownership rules
//!
//! - The execution engine owns run and node-state mutation while a run is
//!   active.
//! - The suspension manager owns suspension records, the merge coordinator
//!   owns merge records, the loop controller owns loop records.
//! - Nothing is mutated after its owning run reaches a terminal status;
//!   implementations must reject such writes with
//!   [`StoreError::RunFinalized`](crate::StoreError::RunFinalized).

use crate::error::Result;
use crate::records::{
    ErrorWorkflowConfig, LoopRecord, MergeRecord, PinnedData, SuspensionRecord,
};
use crate::state::{ExecutionLogEntry, NodeState, Run, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable persistence surface shared by all runtime components.
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- runs ---------------------------------------------------------------

    /// Persist a new run record.
    async fn put_run(&self, run: &Run) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Replace a run record. Rejected once the stored run is terminal.
    async fn update_run(&self, run: &Run) -> Result<()>;

    /// Update only a run's status (and terminal metadata).
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// All runs recorded for a workflow, newest first.
    async fn list_runs_for_workflow(&self, workflow_id: &str) -> Result<Vec<Run>>;

    // -- node states --------------------------------------------------------

    /// Commit one node's state into the run. Rejected for terminal runs.
    async fn put_node_state(&self, run_id: &str, node_id: &str, state: &NodeState) -> Result<()>;

    /// Remove a node's state, as if it never executed. Used by loop resets.
    async fn delete_node_state(&self, run_id: &str, node_id: &str) -> Result<()>;

    // -- suspensions --------------------------------------------------------

    /// Persist a suspension record.
    async fn put_suspension(&self, record: &SuspensionRecord) -> Result<()>;

    /// Fetch a suspension by id.
    async fn get_suspension(&self, id: &str) -> Result<Option<SuspensionRecord>>;

    /// Find the pending suspension listening on a webhook path.
    async fn find_suspension_by_webhook_path(&self, path: &str)
        -> Result<Option<SuspensionRecord>>;

    /// Find the pending suspension with an approval correlation id.
    async fn find_suspension_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<SuspensionRecord>>;

    /// Find the pending suspension waiting on a child run.
    async fn find_suspension_by_child_run(
        &self,
        child_run_id: &str,
    ) -> Result<Option<SuspensionRecord>>;

    /// Atomically move a pending suspension to resolved, recording the
    /// resolution payload. Fails with
    /// [`StoreError::SuspensionNotPending`](crate::StoreError::SuspensionNotPending)
    /// if the suspension already resolved or was cancelled.
    async fn resolve_suspension(
        &self,
        id: &str,
        resolution: serde_json::Value,
    ) -> Result<SuspensionRecord>;

    /// Cancel a pending suspension. Resolved suspensions are left untouched.
    async fn cancel_suspension(&self, id: &str) -> Result<()>;

    /// Pending poll-driven suspensions whose `resume_at` has passed, plus any
    /// pending suspension whose `timeout_at` has passed.
    async fn due_suspensions(&self, now: DateTime<Utc>) -> Result<Vec<SuspensionRecord>>;

    /// Every suspension belonging to a run, any status.
    async fn suspensions_for_run(&self, run_id: &str) -> Result<Vec<SuspensionRecord>>;

    // -- merge records ------------------------------------------------------

    /// Persist a merge record.
    async fn put_merge_record(&self, record: &MergeRecord) -> Result<()>;

    /// Fetch the merge record for a (run, merge node) pair.
    async fn get_merge_record(
        &self,
        run_id: &str,
        merge_node_id: &str,
    ) -> Result<Option<MergeRecord>>;

    // -- loop records -------------------------------------------------------

    /// Persist a loop record.
    async fn put_loop_record(&self, record: &LoopRecord) -> Result<()>;

    /// Fetch the loop record for a (run, loop node) pair.
    async fn get_loop_record(
        &self,
        run_id: &str,
        loop_node_id: &str,
    ) -> Result<Option<LoopRecord>>;

    // -- pinned data --------------------------------------------------------

    /// Persist a pin, replacing any existing pin for the same
    /// (workflow, node, user) key.
    async fn put_pin(&self, pin: &PinnedData) -> Result<()>;

    /// Look up the pin for a (workflow, node, user) key.
    async fn find_pin(
        &self,
        workflow_id: &str,
        node_id: &str,
        user_id: &str,
    ) -> Result<Option<PinnedData>>;

    /// Bump a pin's usage counter.
    async fn record_pin_use(&self, workflow_id: &str, node_id: &str, user_id: &str) -> Result<()>;

    // -- error workflows ----------------------------------------------------

    /// Register an error-workflow binding.
    async fn put_error_workflow_config(&self, config: &ErrorWorkflowConfig) -> Result<()>;

    /// All error-workflow bindings watching a workflow.
    async fn error_workflows_for(&self, workflow_id: &str) -> Result<Vec<ErrorWorkflowConfig>>;

    // -- execution logs -----------------------------------------------------

    /// Append a structured log entry to a run. Rejected for terminal runs.
    async fn append_log(&self, run_id: &str, entry: ExecutionLogEntry) -> Result<()>;
}
