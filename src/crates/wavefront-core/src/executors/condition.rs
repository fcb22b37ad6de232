//! Condition executor: boolean routing.
//!
//! The engine resolves templates before dispatch, so the `expression` config
//! value arrives here as a plain value. The executor coerces it to a boolean
//! and routes through the `true` or `false` output port.

use crate::error::Result;
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor};
use crate::resolver::truthy;
use async_trait::async_trait;
use serde_json::json;

pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let value = input
            .node
            .config
            .get("expression")
            .or_else(|| input.node.config.get("condition"))
            .unwrap_or(&serde_json::Value::Null);
        let branch = truthy(value);
        let port = if branch { "true" } else { "false" };

        Ok(
            ExecutionOutput::ok(json!({"branch": branch, "outputPath": port}))
                .with_output_path(port),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::exec_input;

    #[tokio::test]
    async fn true_expression_routes_true() {
        let input = exec_input("c", "condition", json!({"expression": true}), json!(null));
        let out = ConditionExecutor.execute(input).await.unwrap();
        assert_eq!(out.data["branch"], json!(true));
        assert_eq!(out.meta.output_path.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn falsy_values_route_false() {
        for falsy in [json!(false), json!(0), json!(""), json!(null)] {
            let input = exec_input("c", "condition", json!({ "expression": falsy }), json!(null));
            let out = ConditionExecutor.execute(input).await.unwrap();
            assert_eq!(out.meta.output_path.as_deref(), Some("false"));
        }
    }

    #[tokio::test]
    async fn missing_expression_is_false() {
        let input = exec_input("c", "condition", json!({}), json!(null));
        let out = ConditionExecutor.execute(input).await.unwrap();
        assert_eq!(out.data["branch"], json!(false));
    }
}
