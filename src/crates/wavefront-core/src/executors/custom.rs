//! Fallback executor for unregistered node types.
//!
//! Unknown types must not crash the engine. They pass their inputs through,
//! tagged with the type name, and carry a nominal cost so runaway workflows
//! full of unknown nodes still hit the budget gate.

use crate::budget::NOMINAL_NODE_COST_USD;
use crate::error::Result;
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor, OutputMeta};
use async_trait::async_trait;
use serde_json::json;

pub struct CustomExecutor;

#[async_trait]
impl NodeExecutor for CustomExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        tracing::debug!(
            node = %input.node.id,
            node_type = %input.node.node_type,
            "no dedicated executor, using custom fallback"
        );
        Ok(ExecutionOutput::ok(json!({
            "type": input.node.node_type,
            "input": input.inputs,
        }))
        .with_meta(OutputMeta {
            cost_usd: Some(NOMINAL_NODE_COST_USD),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::exec_input;

    #[tokio::test]
    async fn unknown_type_passes_through_with_nominal_cost() {
        let input = exec_input("x", "vendor-blob", json!({}), json!({"k": 1}));
        let out = CustomExecutor.execute(input).await.unwrap();
        assert!(out.success);
        assert_eq!(out.data["type"], json!("vendor-blob"));
        assert_eq!(out.data["input"], json!({"k": 1}));
        assert_eq!(out.meta.cost_usd, Some(NOMINAL_NODE_COST_USD));
    }
}
