//! Workflow graph model and wire format.
//!
//! A [`WorkflowDefinition`] is the immutable input to a run: nodes, directed
//! edges, declared variables, and run settings. Definitions load from JSON
//! (the canonical wire format) or YAML, and pass structural validation before
//! the topological analyzer ever sees them.
//!
//! Edges out of a loop node carry `sourcePort = "loop"` for the iteration
//! body and `"done"` for the exit path; the `"loop"` edge is the explicit
//! back-edge annotation that keeps loop bodies out of acyclicity analysis.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use wavefront_store::NodeId;

/// Port name on loop nodes for the iteration body edge.
pub const LOOP_PORT: &str = "loop";
/// Port name on loop nodes for the exit edge.
pub const DONE_PORT: &str = "done";

/// Node types treated as batch-iteration loop nodes by the analyzer.
pub const LOOP_NODE_TYPES: &[&str] = &["splitInBatches", "loop"];

/// Canvas position, carried through for round-tripping definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Executor type name, e.g. `http`, `condition`, `splitInBatches`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Arbitrary executor configuration. `data` on the wire.
    #[serde(rename = "data", alias = "config", default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub position: Position,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: serde_json::Value::Object(Default::default()),
            position: Position::default(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Whether this node's type is one of the loop/batch types.
    pub fn is_loop(&self) -> bool {
        LOOP_NODE_TYPES.contains(&self.node_type.as_str())
    }

    /// Per-node execution policy parsed from common config keys.
    pub fn runtime_config(&self) -> NodeRuntimeConfig {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
            condition: None,
        }
    }

    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    /// Whether this edge is the explicit loop back-edge annotation.
    pub fn is_loop_port(&self) -> bool {
        self.source_port.as_deref() == Some(LOOP_PORT)
    }
}

/// A declared workflow variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

/// What the engine does when a node exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Fail the run.
    #[default]
    Stop,
    /// Record the error and keep executing.
    Continue,
    /// Substitute an `on_error` pin if one exists, otherwise stop.
    PinFallback,
}

/// Run-wide error handling mode from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErrorHandlingMode {
    #[serde(rename = "fail-fast")]
    #[default]
    FailFast,
    #[serde(rename = "continue")]
    Continue,
    #[serde(rename = "compensate")]
    Compensate,
}

/// Flight-recorder verbosity from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    Minimal,
    #[default]
    Standard,
    Debug,
}

/// Workflow-level execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Run-level deadline in milliseconds of active execution; suspensions
    /// do not consume it.
    pub max_execution_time: u64,
    /// Default retry attempts per node.
    pub max_retries: u32,
    /// Default delay between retries in milliseconds.
    pub retry_delay: u64,
    /// Intra-wave concurrency bound.
    pub parallel_limit: usize,
    pub error_handling: ErrorHandlingMode,
    pub logging: LoggingMode,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_execution_time: 300_000,
            max_retries: 1,
            retry_delay: 1_000,
            parallel_limit: 5,
            error_handling: ErrorHandlingMode::default(),
            logging: LoggingMode::default(),
        }
    }
}

/// Per-node execution policy read out of the node's config map.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeRuntimeConfig {
    /// Per-node error policy. Falls back to the workflow's `errorHandling`
    /// setting when unset.
    pub on_error: Option<OnErrorPolicy>,
    /// Attempts for this node, overriding `settings.maxRetries`.
    pub retry_count: Option<u32>,
    /// Delay between attempts in milliseconds, overriding
    /// `settings.retryDelay`.
    pub retry_delay: Option<u64>,
    /// Exponential backoff between attempts.
    pub exponential_backoff: bool,
    /// Per-node timeout in milliseconds.
    pub timeout: Option<u64>,
}

/// Immutable workflow definition: the input to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    /// Parse from the canonical JSON wire format.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(raw)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse from a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(raw)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Structural validation: unique node ids and edge endpoints that exist.
    /// Acyclicity is the analyzer's job.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Validation("workflow has no nodes".into()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(EngineError::Validation("node with empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' references unknown source '{}'",
                    edge.id, edge.source
                )));
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge '{}' references unknown target '{}'",
                    edge.id, edge.target
                )));
            }
        }

        Ok(())
    }
}
