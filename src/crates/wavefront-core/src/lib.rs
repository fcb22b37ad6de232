//! # wavefront-core
//!
//! A DAG-aware workflow execution runtime. Workflows are directed graphs of
//! typed nodes (LLM calls, HTTP actions, conditions, loops, waits, human
//! approvals, sub-workflows); the engine analyzes the graph, executes it in
//! parallel waves, persists every state transition, and survives
//! possibly-days-long suspensions by snapshotting runs to durable storage.
//!
//! ```text
//!  trigger ──► analyzer ──► wave loop ──► executors
//!                 │             │             │
//!              cycles?      merge / loop   suspension
//!              rejected     coordinators    manager
//!                               │             │
//!                               └──► state store ◄── resumption worker
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use wavefront_core::{
//!     ExecutionEngine, InMemoryWorkflowProvider, RunOptions, WorkflowDefinition,
//! };
//! use wavefront_store::{InMemoryStateStore, TriggerInfo};
//!
//! # async fn example() -> wavefront_core::Result<()> {
//! let store = Arc::new(InMemoryStateStore::new());
//! let provider = Arc::new(InMemoryWorkflowProvider::new());
//! let engine = ExecutionEngine::new(store, provider);
//!
//! let workflow = WorkflowDefinition::from_json_str(r#"{
//!     "id": "hello", "name": "hello", "version": 1,
//!     "nodes": [
//!         {"id": "t", "type": "trigger", "data": {}},
//!         {"id": "a", "type": "action", "data": {}}
//!     ],
//!     "edges": [{"id": "e1", "source": "t", "target": "a"}]
//! }"#)?;
//!
//! let result = engine
//!     .execute_run(&workflow, TriggerInfo::manual(json!({"x": 1})), RunOptions::default())
//!     .await?;
//! println!("finished: {:?}", result.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`graph`] — workflow wire format and structural validation
//! - [`analyzer`] — Kahn waves, loop scopes, cycle rejection
//! - [`resolver`] — `{{...}}` template resolution with scope guards
//! - [`registry`] / [`executors`] — the executor contract and built-ins
//! - [`loops`] — batch loop iteration control
//! - [`merge`] — multi-branch synchronization
//! - [`suspend`] — durable waits and the resumption worker
//! - [`budget`] — cost projection and enforcement
//! - [`credentials`] — resolve-by-reference secrets, run-scoped cache
//! - [`recorder`] — the per-run flight recorder
//! - [`retry`] — retry policies with backoff
//! - [`engine`] — the orchestration core

pub mod analyzer;
pub mod budget;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod executors;
pub mod graph;
pub mod loops;
pub mod merge;
pub mod recorder;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod suspend;

#[cfg(test)]
pub(crate) mod testkit;

pub use analyzer::{analyze, DagAnalysis, LoopScope};
pub use budget::{estimate_max_cost, BudgetEnforcer, ModelRates};
pub use credentials::{CredentialCache, CredentialResolver, StaticCredentialResolver};
pub use engine::{
    EngineConfig, ExecutionEngine, InMemoryWorkflowProvider, RunOptions, RunResult,
    WorkflowProvider,
};
pub use error::{EngineError, Result};
pub use executors::{ActionHandler, EchoActionHandler, LlmClient, LlmResponse};
pub use graph::{
    Edge, ErrorHandlingMode, LoggingMode, Node, OnErrorPolicy, Position, VariableDefinition,
    WorkflowDefinition, WorkflowSettings, DONE_PORT, LOOP_PORT,
};
pub use loops::{LoopConfig, LoopController, LoopStep};
pub use merge::{MergeConfig, MergeCoordinator, MergeOutcome};
pub use recorder::FlightRecorder;
pub use registry::{
    ExecContext, ExecutionInput, ExecutionOutput, ExecutorRegistry, NodeExecutor, OutputMeta,
    TokenUsage,
};
pub use resolver::{resolve_config, resolve_template, ItemScope, ResolveScope};
pub use retry::RetryPolicy;
pub use suspend::{
    ResumeTarget, Resumption, ResumptionWorker, SuspensionManager, WaitContext, WaitSpec,
    WaitTicket, WebhookDelivery, WebhookReply,
};
