//! # wavefront-store
//!
//! Persistence layer for the Wavefront workflow runtime: the record types a
//! run leaves behind, the [`StateStore`] trait backends implement, a JSON
//! [`SnapshotSerializer`], and an [`InMemoryStateStore`] reference backend.
//!
//! The runtime crate (`wavefront-core`) drives everything through the
//! [`StateStore`] trait, so swapping the backend never touches engine code:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  wavefront-core              │
//! │  engine / suspensions /      │
//! │  merges / loops              │
//! └──────────────┬───────────────┘
//!                │ StateStore trait
//!                ▼
//! ┌──────────────────────────────┐
//! │  backend                     │
//! │  InMemoryStateStore (here)   │
//! │  or a relational store       │
//! └──────────────────────────────┘
//! ```
//!
//! ## What gets persisted
//!
//! - [`Run`] / [`RunState`] / [`NodeState`] — a run and its node outputs.
//! - [`SuspensionRecord`] — durable pause points (timer, datetime, webhook,
//!   approval, sub-workflow, condition) with a full state snapshot.
//! - [`MergeRecord`] — branch-arrival bookkeeping for merge nodes.
//! - [`LoopRecord`] — iteration state for batch loops.
//! - [`PinnedData`] — developer-supplied static node outputs.
//! - [`ErrorWorkflowConfig`] — failure-to-compensation bindings.
//! - [`ExecutionLogEntry`] — the flight-recorder log attached to each run.

pub mod error;
pub mod memory;
pub mod records;
pub mod serializer;
pub mod state;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::InMemoryStateStore;
pub use records::{
    BranchArrival, ConflictPolicy, DataMode, ErrorWorkflowConfig, LoopContext, LoopRecord,
    MergeRecord, MergeStrategy, PinMode, PinnedData, Severity, SuspensionRecord, SuspensionStatus,
    TimeoutAction, WaitKind,
};
pub use serializer::{JsonSerializer, SnapshotSerializer};
pub use state::{
    ExecutionLogEntry, GlobalContext, LogLevel, NodeId, NodeMeta, NodeState, NodeStatus, Run,
    RunError, RunId, RunState, RunStatus, TriggerInfo, TriggerKind,
};
pub use traits::StateStore;
