//! Trigger executor: the entry node of every workflow.

use crate::error::Result;
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor};
use async_trait::async_trait;

/// Passes the trigger payload through as the node's output.
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        Ok(ExecutionOutput::ok(
            input.context.snapshot.trigger.payload.clone(),
        ))
    }
}
