//! Side-effecting action executors: `action`, `http`, `email`, `database`.
//!
//! The actual business logic lives outside the runtime behind the
//! [`ActionHandler`] trait. The engine retries these nodes per their retry
//! policy, so handlers should be idempotent or deduplicate on their side;
//! delivery is at-least-once.

use crate::error::{EngineError, Result};
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// External adapter performing the side effect for an action family.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the action. `family` is the node type (`http`, `email`, ...),
    /// `config` the resolved node config, `inputs` the resolved parent
    /// outputs.
    async fn perform(&self, family: &str, config: &Value, inputs: &Value) -> Result<Value>;
}

/// Default handler: echoes its inputs. Lets workflows execute end to end
/// without any external adapters attached.
pub struct EchoActionHandler;

#[async_trait]
impl ActionHandler for EchoActionHandler {
    async fn perform(&self, _family: &str, _config: &Value, inputs: &Value) -> Result<Value> {
        Ok(inputs.clone())
    }
}

/// Routes one action family through its handler.
pub struct ActionExecutor {
    family: String,
    handler: Arc<dyn ActionHandler>,
}

impl ActionExecutor {
    pub fn new(family: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            family: family.into(),
            handler,
        }
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let data = self
            .handler
            .perform(&self.family, &input.node.config, &input.inputs)
            .await
            .map_err(|e| EngineError::node_execution(&input.node.id, e.to_string()))?;
        Ok(ExecutionOutput::ok(data))
    }
}
