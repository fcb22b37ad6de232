//! LLM executor: completion calls with token and cost accounting.

use crate::budget::ModelRates;
use crate::error::{EngineError, Result};
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor, OutputMeta, TokenUsage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// A completion response from a provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Provider interface. Real adapters live outside the runtime.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str, config: &Value) -> Result<LlmResponse>;
}

/// Deterministic offline client: echoes the prompt. Token counts are derived
/// from the text lengths so budget accounting stays exercised in tests.
#[derive(Default)]
pub struct CannedLlmClient;

#[async_trait]
impl LlmClient for CannedLlmClient {
    async fn complete(&self, model: &str, prompt: &str, _config: &Value) -> Result<LlmResponse> {
        let text = format!("[{model}] {prompt}");
        Ok(LlmResponse {
            usage: TokenUsage {
                prompt_tokens: (prompt.len() / 4) as u64,
                completion_tokens: (text.len() / 4) as u64,
            },
            text,
        })
    }
}

/// Executes `llm` nodes and reports usage and cost.
pub struct LlmExecutor {
    client: Arc<dyn LlmClient>,
    rates: ModelRates,
}

impl LlmExecutor {
    pub fn new(client: Arc<dyn LlmClient>, rates: ModelRates) -> Self {
        Self { client, rates }
    }
}

#[async_trait]
impl NodeExecutor for LlmExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let model = input
            .node
            .config
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("gpt-4o-mini")
            .to_string();
        let prompt = input
            .node
            .config
            .get("prompt")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string())
            .ok_or_else(|| {
                EngineError::Validation(format!("llm node '{}' has no prompt", input.node.id))
            })?;

        let response = self
            .client
            .complete(&model, &prompt, &input.node.config)
            .await
            .map_err(|e| EngineError::node_execution(&input.node.id, e.to_string()))?;

        let cost = self.rates.rate(&model);
        tracing::debug!(
            node = %input.node.id,
            model = %model,
            tokens = response.usage.total(),
            cost_usd = cost,
            "llm completion"
        );

        Ok(ExecutionOutput::ok(json!({
            "text": response.text,
            "model": model,
        }))
        .with_meta(OutputMeta {
            token_usage: Some(response.usage),
            cost_usd: Some(cost),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::exec_input;

    #[tokio::test]
    async fn reports_usage_and_cost() {
        let executor = LlmExecutor::new(Arc::new(CannedLlmClient), ModelRates::default());
        let input = exec_input(
            "ask",
            "llm",
            json!({"model": "gpt-4o", "prompt": "summarize this"}),
            json!(null),
        );
        let out = executor.execute(input).await.unwrap();
        assert!(out.success);
        assert!(out.data["text"].as_str().unwrap().contains("summarize"));
        assert!(out.meta.token_usage.is_some());
        assert!((out.meta.cost_usd.unwrap() - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_prompt_is_a_validation_error() {
        let executor = LlmExecutor::new(Arc::new(CannedLlmClient), ModelRates::default());
        let input = exec_input("ask", "llm", json!({"model": "gpt-4o"}), json!(null));
        assert!(matches!(
            executor.execute(input).await,
            Err(EngineError::Validation(_))
        ));
    }
}
