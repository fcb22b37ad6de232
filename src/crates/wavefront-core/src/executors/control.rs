//! Control-flow executors: waits, approvals, sub-workflows, loops, merges.
//!
//! These executors delegate to the coordinators that own the corresponding
//! records. They perform no side effects of their own; they record state and
//! raise the meta flags the engine reacts to.

use crate::error::{EngineError, Result};
use crate::loops::{LoopConfig, LoopController, LoopStep};
use crate::merge::{MergeConfig, MergeCoordinator, MergeOutcome};
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor, OutputMeta};
use crate::resolver::items_of;
use crate::suspend::{SuspensionManager, WaitContext, WaitSpec};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use wavefront_store::{BranchArrival, NodeStatus};

fn wait_context(input: &ExecutionInput) -> WaitContext {
    WaitContext {
        run_id: input.context.run_id.clone(),
        workflow_id: input.context.workflow_id.clone(),
        node_id: input.node.id.clone(),
        pending_node_ids: input.context.pending_node_ids.clone(),
    }
}

fn suspended_output(
    data: serde_json::Value,
    suspension_id: String,
) -> ExecutionOutput {
    ExecutionOutput {
        data,
        success: true,
        error: None,
        meta: OutputMeta {
            suspended: true,
            suspension_id: Some(suspension_id),
            ..Default::default()
        },
    }
}

// ---------------------------------------------------------------------------
// wait
// ---------------------------------------------------------------------------

/// `wait` nodes: timer, datetime, and condition waits.
pub struct WaitExecutor {
    suspensions: Arc<SuspensionManager>,
}

impl WaitExecutor {
    pub fn new(suspensions: Arc<SuspensionManager>) -> Self {
        Self { suspensions }
    }
}

#[async_trait]
impl NodeExecutor for WaitExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let spec = WaitSpec::from_wait_config(&input.node.config)?;
        let ticket = self
            .suspensions
            .start_wait(&wait_context(&input), spec, &input.context.snapshot)
            .await?;
        // Wait nodes pass their input through once resumed; park it as the
        // provisional output so the resume payload can fall back to it.
        Ok(suspended_output(input.inputs, ticket.suspension_id))
    }
}

// ---------------------------------------------------------------------------
// webhookWait
// ---------------------------------------------------------------------------

/// `webhookWait` nodes: suspend until an authenticated request arrives.
pub struct WebhookWaitExecutor {
    suspensions: Arc<SuspensionManager>,
}

impl WebhookWaitExecutor {
    pub fn new(suspensions: Arc<SuspensionManager>) -> Self {
        Self { suspensions }
    }
}

#[async_trait]
impl NodeExecutor for WebhookWaitExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let spec = WaitSpec::from_webhook_config(
            &input.node.config,
            &input.context.run_id,
            &input.node.id,
        )?;
        let ticket = self
            .suspensions
            .start_wait(&wait_context(&input), spec, &input.context.snapshot)
            .await?;
        let data = json!({
            "waitingFor": "webhook",
            "webhookPath": ticket.webhook_path,
        });
        Ok(suspended_output(data, ticket.suspension_id))
    }
}

// ---------------------------------------------------------------------------
// approval
// ---------------------------------------------------------------------------

/// `approval` nodes: suspend on a human-approval correlation id.
pub struct ApprovalExecutor {
    suspensions: Arc<SuspensionManager>,
}

impl ApprovalExecutor {
    pub fn new(suspensions: Arc<SuspensionManager>) -> Self {
        Self { suspensions }
    }
}

#[async_trait]
impl NodeExecutor for ApprovalExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let mut spec = WaitSpec::approval();
        if let Some(configured) = input
            .node
            .config
            .get("correlationId")
            .and_then(|c| c.as_str())
        {
            spec.correlation_id = Some(configured.to_string());
        }
        let ticket = self
            .suspensions
            .start_wait(&wait_context(&input), spec, &input.context.snapshot)
            .await?;
        let data = json!({
            "waitingFor": "approval",
            "correlationId": ticket.correlation_id,
        });
        Ok(suspended_output(data, ticket.suspension_id))
    }
}

// ---------------------------------------------------------------------------
// executeWorkflow
// ---------------------------------------------------------------------------

/// `executeWorkflow` nodes: suspend the parent until a child run finishes.
/// The engine observes the subworkflow suspension and launches the child.
pub struct ExecuteWorkflowExecutor {
    suspensions: Arc<SuspensionManager>,
}

impl ExecuteWorkflowExecutor {
    pub fn new(suspensions: Arc<SuspensionManager>) -> Self {
        Self { suspensions }
    }
}

#[async_trait]
impl NodeExecutor for ExecuteWorkflowExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let workflow_id = input
            .node
            .config
            .get("workflowId")
            .and_then(|w| w.as_str())
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "executeWorkflow node '{}' has no workflowId",
                    input.node.id
                ))
            })?;
        let child_input = input
            .node
            .config
            .get("input")
            .cloned()
            .unwrap_or_else(|| input.inputs.clone());

        let spec = WaitSpec::subworkflow(workflow_id, child_input);
        let ticket = self
            .suspensions
            .start_wait(&wait_context(&input), spec, &input.context.snapshot)
            .await?;
        let data = json!({
            "waitingFor": "subworkflow",
            "childRunId": ticket.child_run_id,
        });
        Ok(suspended_output(data, ticket.suspension_id))
    }
}

// ---------------------------------------------------------------------------
// splitInBatches
// ---------------------------------------------------------------------------

/// `splitInBatches` nodes: batch iteration driven by the loop controller.
pub struct SplitInBatchesExecutor {
    loops: Arc<LoopController>,
}

impl SplitInBatchesExecutor {
    pub fn new(loops: Arc<LoopController>) -> Self {
        Self { loops }
    }
}

#[async_trait]
impl NodeExecutor for SplitInBatchesExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let config = LoopConfig::from_node_config(&input.node.config);
        let scope = input
            .context
            .analysis
            .loop_scopes
            .get(&input.node.id)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "loop node '{}' has no detected scope",
                    input.node.id
                ))
            })?
            .clone();

        let step = self
            .loops
            .advance(
                &input.context.run_id,
                &input.node.id,
                &config,
                &scope,
                &input.inputs,
                input.context.iteration_results.clone(),
            )
            .await?;

        match step {
            LoopStep::Emit { batch, context } => {
                let mut out = ExecutionOutput::ok(json!(batch)).with_output_path("loop");
                out.meta.continue_loop = true;
                tracing::debug!(
                    node = %input.node.id,
                    run_index = context.run_index,
                    batch_len = batch_len(&out.data),
                    "loop emitted batch"
                );
                Ok(out)
            }
            LoopStep::Done { aggregated } => {
                Ok(ExecutionOutput::ok(json!(aggregated)).with_output_path("done"))
            }
        }
    }
}

fn batch_len(data: &serde_json::Value) -> usize {
    data.as_array().map(|a| a.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// `merge` nodes: record the arrivals of completed parent branches and emit
/// the combined output once the strategy's predicate holds.
pub struct MergeExecutor {
    merges: Arc<MergeCoordinator>,
}

impl MergeExecutor {
    pub fn new(merges: Arc<MergeCoordinator>) -> Self {
        Self { merges }
    }
}

#[async_trait]
impl NodeExecutor for MergeExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let config = MergeConfig::from_node_config(&input.node.config);
        let snapshot = &input.context.snapshot;

        // Contributing branches: every parent that was not skipped. Errored
        // parents with `continue` still deliver their error output.
        let parents = input.context.analysis.parents_of(&input.node.id);
        let mut arrived: Vec<(&str, &wavefront_store::NodeState)> = parents
            .iter()
            .filter_map(|p| snapshot.nodes.get(p.as_str()).map(|s| (p.as_str(), s)))
            .filter(|(_, s)| {
                matches!(s.meta.status, NodeStatus::Completed | NodeStatus::Error)
            })
            .collect();
        // Arrival order is completion order.
        arrived.sort_by_key(|(_, s)| s.meta.completed_at);

        let expected = input
            .node
            .config
            .get("expectedBranches")
            .and_then(|e| e.as_u64())
            .map(|e| e as usize)
            .unwrap_or_else(|| arrived.len());

        let mut last = MergeOutcome::Pending {
            arrived: 0,
            required: expected,
        };
        for (parent_id, state) in &arrived {
            let arrival = BranchArrival {
                node_id: parent_id.to_string(),
                items: items_of(&state.output),
                completed_at: state.meta.completed_at.unwrap_or_else(Utc::now),
                metadata: None,
            };
            last = self
                .merges
                .record_arrival(
                    &input.context.run_id,
                    &input.node.id,
                    expected,
                    &config,
                    parent_id,
                    arrival,
                )
                .await?;
            if matches!(last, MergeOutcome::Complete { .. }) {
                break;
            }
        }

        match last {
            MergeOutcome::Complete { items } => Ok(ExecutionOutput::ok(json!(items))),
            MergeOutcome::Pending { arrived, required } => {
                let mut out = ExecutionOutput::ok(json!(null));
                out.meta.waiting_for_merge = true;
                tracing::debug!(
                    node = %input.node.id,
                    arrived,
                    required,
                    "merge still waiting for branches"
                );
                Ok(out)
            }
        }
    }
}
