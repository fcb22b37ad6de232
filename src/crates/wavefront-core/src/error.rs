//! Error types for the execution runtime.
//!
//! The taxonomy mirrors how failures are recovered:
//!
//! - `Validation` / `CycleDetected` reject a workflow before any node runs.
//! - `Resolver` and `NodeExecution` are recovered per node when the node's
//!   `onError` policy allows.
//! - `BudgetExceeded`, `Timeout`, `RecursionLimit`, and `Suspension` surface
//!   to the run and produce a `failed` terminal status (or keep the run
//!   suspended, for rejected resumes).

use thiserror::Error;
use wavefront_store::StoreError;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors the runtime can produce.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid graph or configuration: duplicate node ids, dangling edges,
    /// missing executor config, bad settings. Rejected before execution.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// A cycle was found outside any loop scope. The path walks the cycle.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Node ids along the offending cycle.
        path: Vec<String>,
    },

    /// A variable reference could not be resolved.
    #[error("failed to resolve '{reference}': {reason}")]
    Resolver {
        /// The reference text inside `{{...}}`.
        reference: String,
        /// Why resolution failed.
        reason: String,
    },

    /// A node's executor failed.
    #[error("node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Id of the node that failed.
        node: String,
        /// Error message from the executor.
        error: String,
    },

    /// Projected or accrued cost exceeded the run's budget.
    #[error("budget exceeded: projected ${projected:.4} over remaining ${remaining:.4}")]
    BudgetExceeded {
        /// Cost that would be incurred.
        projected: f64,
        /// Budget left when the check ran.
        remaining: f64,
    },

    /// A node or the run exceeded its deadline.
    #[error("'{scope}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// What timed out: a node id or `run`.
        scope: String,
        /// Milliseconds elapsed when the deadline fired.
        elapsed_ms: u64,
    },

    /// A resume was rejected: unknown, expired, or already-resolved
    /// suspension. The run stays suspended until its timeout policy fires.
    #[error("suspension error: {0}")]
    Suspension(String),

    /// Sub-workflow nesting exceeded the configured depth.
    #[error("sub-workflow recursion limit ({limit}) exceeded")]
    RecursionLimit {
        /// The configured maximum depth.
        limit: u32,
    },

    /// The run was cancelled.
    #[error("run '{0}' was cancelled")]
    Cancelled(String),

    /// Persistence failure from the state store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing failure when loading a workflow definition.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Node execution failure with context.
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Resolver failure with the offending reference.
    pub fn resolver(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolver {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable code used in run errors and log entries.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::CycleDetected { .. } => "CycleDetected",
            EngineError::Resolver { .. } => "ResolverError",
            EngineError::NodeExecution { .. } => "ExecutorError",
            EngineError::BudgetExceeded { .. } => "BudgetExceeded",
            EngineError::Timeout { .. } => "Timeout",
            EngineError::Suspension(_) => "SuspensionError",
            EngineError::RecursionLimit { .. } => "RecursionLimit",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Store(_) => "StoreError",
            EngineError::Serialization(_) => "SerializationError",
            EngineError::Yaml(_) => "ValidationError",
        }
    }
}
