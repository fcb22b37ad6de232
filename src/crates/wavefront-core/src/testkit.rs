//! Shared helpers for unit tests.

use crate::analyzer::analyze;
use crate::graph::{Node, WorkflowSettings};
use crate::registry::{ExecContext, ExecutionInput};
use serde_json::{json, Value};
use std::sync::Arc;
use wavefront_store::{GlobalContext, RunState, TriggerInfo};

/// An execution input over a one-node graph with a `{"seed": true}` trigger.
pub fn exec_input(node_id: &str, node_type: &str, config: Value, inputs: Value) -> ExecutionInput {
    let node = Node::new(node_id, node_type).with_config(config);
    let analysis = Arc::new(analyze(&[Node::new(node_id, node_type)], &[]).unwrap());
    let global = GlobalContext {
        user_id: "u-test".into(),
        workspace_id: "ws-test".into(),
        env: "test".into(),
        started_at: chrono::Utc::now(),
        is_test: true,
    };
    let snapshot = RunState::new(global, TriggerInfo::manual(json!({"seed": true})));

    ExecutionInput {
        node,
        inputs,
        context: ExecContext {
            run_id: "r-test".into(),
            workflow_id: "wf-test".into(),
            user_id: "u-test".into(),
            is_test: true,
            snapshot,
            analysis,
            settings: WorkflowSettings::default(),
            loop_context: None,
            iteration_results: None,
            pending_node_ids: vec![],
        },
    }
}
