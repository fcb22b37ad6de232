//! Node executor contract and registry.
//!
//! Every node type maps to an implementation of [`NodeExecutor`], the uniform
//! interface between the engine and node business logic. The engine wraps
//! each invocation with the cross-cutting concerns (credential resolution,
//! template resolution, pinning, retries, cost accounting), so executors see
//! fully resolved config and only report what happened through
//! [`ExecutionOutput`].
//!
//! Control-flow behavior is signalled, not performed: an executor sets
//! `meta.suspended`, `meta.waiting_for_merge`, `meta.continue_loop`, or
//! `meta.output_path`, and the engine reacts. Unknown node types fall back to
//! the registered default executor rather than failing the run.

use crate::analyzer::DagAnalysis;
use crate::error::Result;
use crate::graph::{Node, WorkflowSettings};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use wavefront_store::{LoopContext, NodeId, RunId, RunState};

/// Token consumption reported by LLM executors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Post-processing flags attached to an executor's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputMeta {
    /// The node joined a merge that is not complete yet.
    pub waiting_for_merge: bool,
    /// The node started a durable wait; the run must park.
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension_id: Option<String>,
    /// The node is a loop that emitted a batch; the engine must drive the
    /// loop scope before the wave continues.
    pub continue_loop: bool,
    /// Which output port carries this result (`true`/`false` for
    /// conditions, `loop`/`done` for loops).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// What an executor returns.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub data: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
    pub meta: OutputMeta,
}

impl ExecutionOutput {
    /// Successful output with no control-flow flags.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            data,
            success: true,
            error: None,
            meta: OutputMeta::default(),
        }
    }

    /// Recoverable executor-level failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            data: serde_json::Value::Null,
            success: false,
            error: Some(error.into()),
            meta: OutputMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: OutputMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.meta.output_path = Some(path.into());
        self
    }
}

/// Run-scoped context handed to every executor invocation.
#[derive(Clone)]
pub struct ExecContext {
    pub run_id: RunId,
    pub workflow_id: String,
    pub user_id: String,
    pub is_test: bool,
    /// Run state at dispatch time. Wait executors snapshot this.
    pub snapshot: RunState,
    pub analysis: Arc<DagAnalysis>,
    pub settings: WorkflowSettings,
    /// Innermost loop context when executing inside a loop scope.
    pub loop_context: Option<LoopContext>,
    /// Feedback outputs collected for a loop node re-invocation.
    pub iteration_results: Option<Vec<serde_json::Value>>,
    /// Nodes still pending downstream of the executing node.
    pub pending_node_ids: Vec<NodeId>,
}

/// The input contract for an executor invocation.
#[derive(Clone)]
pub struct ExecutionInput {
    /// The node, with credentials and templates already resolved into its
    /// config.
    pub node: Node,
    /// Resolved parent outputs: a single parent's value directly, or a map
    /// keyed by source node id for multiple parents.
    pub inputs: serde_json::Value,
    pub context: ExecContext,
}

/// Uniform interface implemented by every node type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput>;
}

/// Maps node `type` strings to executor implementations.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    fallback: Arc<dyn NodeExecutor>,
}

impl ExecutorRegistry {
    /// An empty registry routing every type to `fallback`.
    pub fn new(fallback: Arc<dyn NodeExecutor>) -> Self {
        Self {
            executors: HashMap::new(),
            fallback,
        }
    }

    /// Register an executor for a node type, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type.into(), executor);
    }

    /// The executor for a node type, or the fallback for unknown types.
    pub fn get(&self, node_type: &str) -> Arc<dyn NodeExecutor> {
        self.executors
            .get(node_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Whether a dedicated executor is registered for this type.
    pub fn has(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.executors.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl NodeExecutor for Echo {
        async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
            Ok(ExecutionOutput::ok(input.inputs))
        }
    }

    struct Marker(&'static str);

    #[async_trait]
    impl NodeExecutor for Marker {
        async fn execute(&self, _input: ExecutionInput) -> Result<ExecutionOutput> {
            Ok(ExecutionOutput::ok(json!({"marker": self.0})))
        }
    }

    #[test]
    fn unknown_types_route_to_fallback() {
        let mut registry = ExecutorRegistry::new(Arc::new(Echo));
        registry.register("action", Arc::new(Marker("action")));

        assert!(registry.has("action"));
        assert!(!registry.has("some-vendor-node"));
        // Fallback is returned, not an error.
        let _ = registry.get("some-vendor-node");
    }

    #[test]
    fn output_helpers() {
        let out = ExecutionOutput::ok(json!(1)).with_output_path("true");
        assert!(out.success);
        assert_eq!(out.meta.output_path.as_deref(), Some("true"));

        let failed = ExecutionOutput::failed("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn meta_serializes_camel_case() {
        let meta = OutputMeta {
            waiting_for_merge: true,
            suspension_id: Some("s1".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["waitingForMerge"], json!(true));
        assert_eq!(value["suspensionId"], json!("s1"));
    }
}
