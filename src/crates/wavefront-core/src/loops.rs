//! Loop control for batch-iteration nodes.
//!
//! A `splitInBatches` node slices its input items into batches and replays
//! its scope once per batch. The controller owns the loop record: the item
//! list, the context stack (nested loops stack), and the aggregated outputs
//! captured from feedback nodes.
//!
//! Iteration protocol:
//!
//! 1. First entry initializes the record and emits batch 0 through the
//!    `loop` port.
//! 2. After the scope finishes an iteration, the engine hands the feedback
//!    outputs back. The controller aggregates them, resets every scoped
//!    node's state, advances the counters, and emits the next batch.
//! 3. When the items are exhausted (or the iteration cap trips), the
//!    aggregated output leaves through the `done` port.
//!
//! Iterations are strictly sequential: the engine drains one full iteration
//! of the scope before the controller is asked to advance.

use crate::analyzer::LoopScope;
use crate::error::Result;
use crate::resolver::items_of;
use serde_json::Value;
use std::sync::Arc;
use wavefront_store::{LoopContext, LoopRecord, StateStore};

/// Loop behavior parsed from the loop node's config.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopConfig {
    pub batch_size: usize,
    pub max_iterations: usize,
}

impl LoopConfig {
    pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

    pub fn from_node_config(config: &Value) -> Self {
        serde_json::from_value(config.clone()).unwrap_or_default()
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// What the loop node does next.
#[derive(Debug, Clone)]
pub enum LoopStep {
    /// Emit `batch` through the `loop` port and run the scope once more.
    Emit {
        batch: Vec<Value>,
        context: LoopContext,
    },
    /// The loop is finished; emit the aggregate through the `done` port.
    Done { aggregated: Vec<Value> },
}

/// Owns loop records and drives the iteration protocol.
pub struct LoopController {
    store: Arc<dyn StateStore>,
}

impl LoopController {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The active context for a loop, if one is mid-iteration.
    pub async fn current_context(
        &self,
        run_id: &str,
        loop_node_id: &str,
    ) -> Result<Option<LoopContext>> {
        Ok(self
            .store
            .get_loop_record(run_id, loop_node_id)
            .await?
            .and_then(|r| r.context_stack.last().cloned()))
    }

    /// Advance the loop: first entry emits batch 0, re-entries aggregate the
    /// iteration's feedback and emit the next batch or finish.
    pub async fn advance(
        &self,
        run_id: &str,
        loop_node_id: &str,
        config: &LoopConfig,
        scope: &LoopScope,
        input: &Value,
        iteration_results: Option<Vec<Value>>,
    ) -> Result<LoopStep> {
        let batch_size = config.batch_size.max(1);
        let existing = self.store.get_loop_record(run_id, loop_node_id).await?;

        let mut record = match existing {
            Some(record) if !record.context_stack.is_empty() => record,
            _ => {
                // First entry: capture items and open iteration 0.
                let items = items_of(input);
                let total = items.len();
                let mut record = LoopRecord {
                    run_id: run_id.to_string(),
                    loop_node_id: loop_node_id.to_string(),
                    scope: scope.scope.clone(),
                    feedback_node_ids: scope.feedback_node_ids.clone(),
                    context_stack: Vec::new(),
                    aggregated: Vec::new(),
                    items,
                };

                if total == 0 {
                    self.store.put_loop_record(&record).await?;
                    return Ok(LoopStep::Done { aggregated: vec![] });
                }

                let context = LoopContext {
                    run_index: 0,
                    batch_index: 0,
                    item_index: 0,
                    batch_size,
                    total_items: total,
                    is_last_batch: total <= batch_size,
                    loop_node_id: loop_node_id.to_string(),
                };
                record.context_stack.push(context.clone());
                self.store.put_loop_record(&record).await?;

                let batch = record.items[..batch_size.min(total)].to_vec();
                return Ok(LoopStep::Emit { batch, context });
            }
        };

        // Re-entry: fold the iteration's feedback into the aggregate. Each
        // item in a feedback output counts as one emission.
        if let Some(results) = iteration_results {
            for result in results {
                record.aggregated.extend(items_of(&result));
            }
        }

        let current = record
            .context_stack
            .last()
            .cloned()
            .expect("re-entered loop has an open context");
        let total = record.items.len();
        let emitted = batch_size.min(total.saturating_sub(current.item_index));
        let next_index = current.item_index + emitted;
        let next_run = current.run_index + 1;

        if next_index >= total {
            record.context_stack.pop();
            let aggregated = record.aggregated.clone();
            self.store.put_loop_record(&record).await?;
            tracing::debug!(
                run = run_id,
                node = loop_node_id,
                iterations = next_run,
                items = aggregated.len(),
                "loop drained"
            );
            return Ok(LoopStep::Done { aggregated });
        }

        if next_run >= config.max_iterations {
            tracing::warn!(
                run = run_id,
                node = loop_node_id,
                max_iterations = config.max_iterations,
                "loop hit its iteration cap, terminating via done"
            );
            record.context_stack.pop();
            let aggregated = record.aggregated.clone();
            self.store.put_loop_record(&record).await?;
            return Ok(LoopStep::Done { aggregated });
        }

        // Scoped nodes start the next iteration as if they never ran.
        self.reset_scope(run_id, &record).await?;

        let context = LoopContext {
            run_index: next_run,
            batch_index: next_run,
            item_index: next_index,
            batch_size,
            total_items: total,
            is_last_batch: next_index + batch_size >= total,
            loop_node_id: loop_node_id.to_string(),
        };
        *record.context_stack.last_mut().expect("context present") = context.clone();
        self.store.put_loop_record(&record).await?;

        let batch = record.items[next_index..(next_index + batch_size).min(total)].to_vec();
        Ok(LoopStep::Emit { batch, context })
    }

    async fn reset_scope(&self, run_id: &str, record: &LoopRecord) -> Result<()> {
        for node_id in &record.scope {
            if node_id != &record.loop_node_id {
                self.store.delete_node_state(run_id, node_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use wavefront_store::{
        GlobalContext, InMemoryStateStore, NodeMeta, NodeState, Run, RunState, TriggerInfo,
    };

    fn scope_of(nodes: &[&str], feedback: &[&str]) -> LoopScope {
        LoopScope {
            loop_node_id: "l".into(),
            scope: nodes.iter().map(|s| s.to_string()).collect(),
            feedback_node_ids: feedback.iter().map(|s| s.to_string()).collect(),
            loop_target: nodes.first().map(|s| s.to_string()),
            done_target: Some("out".into()),
        }
    }

    async fn setup() -> (Arc<InMemoryStateStore>, LoopController) {
        let store = Arc::new(InMemoryStateStore::new());
        let state = RunState::new(GlobalContext::default(), TriggerInfo::manual(json!({})));
        use wavefront_store::StateStore as _;
        store
            .put_run(&Run::new("r1".into(), "wf", state))
            .await
            .unwrap();
        let controller = LoopController::new(store.clone());
        (store, controller)
    }

    #[tokio::test]
    async fn ten_items_batch_three_runs_four_iterations() {
        let (_store, controller) = setup().await;
        let config = LoopConfig {
            batch_size: 3,
            max_iterations: 1000,
        };
        let scope = scope_of(&["double"], &["double"]);
        let input = json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        // Iteration 0.
        let step = controller
            .advance("r1", "l", &config, &scope, &input, None)
            .await
            .unwrap();
        let (batch, ctx) = match step {
            LoopStep::Emit { batch, context } => (batch, context),
            other => panic!("expected emit, got {other:?}"),
        };
        assert_eq!(batch, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(ctx.run_index, 0);
        assert_eq!(ctx.total_items, 10);
        assert!(!ctx.is_last_batch);

        // Iterations 1..3: feed back doubled batches.
        let mut seen_run_indexes = vec![0];
        let mut feedback = json!([2, 4, 6]);
        let mut last_sizes = vec![batch.len()];
        loop {
            let step = controller
                .advance("r1", "l", &config, &scope, &input, Some(vec![feedback.clone()]))
                .await
                .unwrap();
            match step {
                LoopStep::Emit { batch, context } => {
                    seen_run_indexes.push(context.run_index);
                    last_sizes.push(batch.len());
                    feedback = json!(batch
                        .iter()
                        .map(|v| v.as_i64().unwrap() * 2)
                        .collect::<Vec<_>>());
                    if context.is_last_batch {
                        assert_eq!(context.run_index, 3);
                    }
                }
                LoopStep::Done { aggregated } => {
                    assert_eq!(
                        aggregated,
                        (1..=10).map(|n| json!(n * 2)).collect::<Vec<_>>()
                    );
                    break;
                }
            }
        }
        assert_eq!(seen_run_indexes, vec![0, 1, 2, 3]);
        assert_eq!(last_sizes, vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn empty_input_finishes_immediately() {
        let (_store, controller) = setup().await;
        let config = LoopConfig::default();
        let scope = scope_of(&["body"], &["body"]);

        let step = controller
            .advance("r1", "l", &config, &scope, &json!([]), None)
            .await
            .unwrap();
        assert!(matches!(step, LoopStep::Done { aggregated } if aggregated.is_empty()));
    }

    #[tokio::test]
    async fn scalar_input_is_a_single_item() {
        let (_store, controller) = setup().await;
        let config = LoopConfig::default();
        let scope = scope_of(&["body"], &["body"]);

        let step = controller
            .advance("r1", "l", &config, &scope, &json!({"only": true}), None)
            .await
            .unwrap();
        match step {
            LoopStep::Emit { batch, context } => {
                assert_eq!(batch, vec![json!({"only": true})]);
                assert!(context.is_last_batch);
            }
            other => panic!("expected emit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn iteration_cap_exits_via_done() {
        let (_store, controller) = setup().await;
        let config = LoopConfig {
            batch_size: 1,
            max_iterations: 2,
        };
        let scope = scope_of(&["body"], &["body"]);
        let input = json!([1, 2, 3, 4, 5]);

        let mut steps = 0;
        let mut step = controller
            .advance("r1", "l", &config, &scope, &input, None)
            .await
            .unwrap();
        while let LoopStep::Emit { .. } = step {
            steps += 1;
            step = controller
                .advance("r1", "l", &config, &scope, &input, Some(vec![json!([0])]))
                .await
                .unwrap();
        }
        // Two emissions, then the cap forces done despite remaining items.
        assert_eq!(steps, 2);
        match step {
            LoopStep::Done { aggregated } => assert_eq!(aggregated.len(), 2),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_clears_scope_node_states() {
        let (store, controller) = setup().await;
        let config = LoopConfig {
            batch_size: 1,
            max_iterations: 100,
        };
        let scope = scope_of(&["body"], &["body"]);
        use wavefront_store::StateStore as _;

        controller
            .advance("r1", "l", &config, &scope, &json!([1, 2]), None)
            .await
            .unwrap();

        // Simulate the scope node having run.
        store
            .put_node_state(
                "r1",
                "body",
                &NodeState {
                    output: json!([2]),
                    meta: NodeMeta::running(),
                },
            )
            .await
            .unwrap();

        controller
            .advance("r1", "l", &config, &scope, &json!([1, 2]), Some(vec![json!([2])]))
            .await
            .unwrap();

        let run = store.get_run("r1").await.unwrap().unwrap();
        assert!(
            !run.state.nodes.contains_key("body"),
            "scope node state must be absent after reset"
        );
    }

    #[tokio::test]
    async fn current_context_reflects_top_of_stack() {
        let (_store, controller) = setup().await;
        let config = LoopConfig {
            batch_size: 2,
            max_iterations: 100,
        };
        let scope = scope_of(&["body"], &["body"]);

        assert!(controller
            .current_context("r1", "l")
            .await
            .unwrap()
            .is_none());

        controller
            .advance("r1", "l", &config, &scope, &json!([1, 2, 3]), None)
            .await
            .unwrap();

        let ctx = controller.current_context("r1", "l").await.unwrap().unwrap();
        assert_eq!(ctx.run_index, 0);
        assert_eq!(ctx.batch_size, 2);
    }
}
