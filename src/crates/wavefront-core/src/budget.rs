//! Cost budget estimation and enforcement.
//!
//! Before the first node runs, the engine projects the maximum cost the
//! workflow could incur: each LLM node contributes its per-model rate, nodes
//! inside a loop scope are multiplied by the loop's iteration cap, and
//! unknown node types carry a nominal cost. If the projection exceeds the
//! remaining budget and enforcement is on, the run is rejected before any
//! side effect happens.
//!
//! During the run, actual costs reported by executors accrue against the same
//! budget; crossing it mid-run fails the run with the same error code.

use crate::analyzer::DagAnalysis;
use crate::error::{EngineError, Result};
use crate::graph::WorkflowDefinition;
use crate::loops::LoopConfig;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Cost attributed to node types without a model-specific rate.
pub const NOMINAL_NODE_COST_USD: f64 = 0.0001;

/// Per-invocation cost estimates by model name.
#[derive(Debug, Clone)]
pub struct ModelRates {
    rates: HashMap<String, f64>,
    default_rate: f64,
}

impl Default for ModelRates {
    fn default() -> Self {
        let rates = HashMap::from([
            ("gpt-4o".to_string(), 0.02),
            ("gpt-4o-mini".to_string(), 0.002),
            ("claude-3-5-sonnet".to_string(), 0.018),
            ("claude-3-haiku".to_string(), 0.002),
            ("gemini-1.5-pro".to_string(), 0.012),
        ]);
        Self {
            rates,
            default_rate: 0.01,
        }
    }
}

impl ModelRates {
    pub fn rate(&self, model: &str) -> f64 {
        self.rates.get(model).copied().unwrap_or(self.default_rate)
    }
}

/// Project the maximum cost of one full run of a workflow.
pub fn estimate_max_cost(
    workflow: &WorkflowDefinition,
    analysis: &DagAnalysis,
    rates: &ModelRates,
) -> f64 {
    workflow
        .nodes
        .iter()
        .map(|node| {
            let per_call = match node.node_type.as_str() {
                "llm" => {
                    let model = node
                        .config
                        .get("model")
                        .and_then(|m| m.as_str())
                        .unwrap_or("");
                    rates.rate(model)
                }
                "trigger" | "condition" | "merge" | "wait" | "webhookWait" | "approval"
                | "transform" | "set" | "splitInBatches" | "loop" | "executeWorkflow" => 0.0,
                "action" | "http" | "email" | "database" => 0.0,
                // Unknown types run through the custom executor at nominal cost.
                _ => NOMINAL_NODE_COST_USD,
            };
            let multiplier = match analysis.scope_owner(&node.id) {
                Some(scope) => {
                    let loop_node = workflow.node(&scope.loop_node_id);
                    loop_node
                        .map(|l| LoopConfig::from_node_config(&l.config).max_iterations)
                        .unwrap_or(LoopConfig::DEFAULT_MAX_ITERATIONS) as f64
                }
                None => 1.0,
            };
            per_call * multiplier
        })
        .sum()
}

/// Mutable budget state shared across a run's workers.
pub struct BudgetEnforcer {
    limit_usd: Option<f64>,
    spent_usd: Mutex<f64>,
}

impl BudgetEnforcer {
    /// `limit` of `None` disables enforcement entirely.
    pub fn new(limit: Option<f64>) -> Self {
        Self {
            limit_usd: limit,
            spent_usd: Mutex::new(0.0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit_usd.is_some()
    }

    /// Pre-flight gate: rejects when the projected maximum exceeds what is
    /// left of the budget.
    pub async fn preflight(&self, projected: f64) -> Result<()> {
        let Some(limit) = self.limit_usd else {
            return Ok(());
        };
        let spent = *self.spent_usd.lock().await;
        let remaining = (limit - spent).max(0.0);
        if projected > remaining {
            return Err(EngineError::BudgetExceeded {
                projected,
                remaining,
            });
        }
        Ok(())
    }

    /// Accrue an actual cost. Errors once the accrued total crosses the
    /// limit.
    pub async fn charge(&self, cost: f64) -> Result<()> {
        let Some(limit) = self.limit_usd else {
            return Ok(());
        };
        let mut spent = self.spent_usd.lock().await;
        *spent += cost;
        if *spent > limit {
            return Err(EngineError::BudgetExceeded {
                projected: cost,
                remaining: (limit - (*spent - cost)).max(0.0),
            });
        }
        Ok(())
    }

    pub async fn spent(&self) -> f64 {
        *self.spent_usd.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::graph::{Edge, Node, WorkflowSettings, DONE_PORT, LOOP_PORT};
    use serde_json::json;

    fn workflow_with_loop_llm() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "budget".into(),
            version: 1,
            nodes: vec![
                Node::new("t", "trigger"),
                Node::new("l", "splitInBatches").with_config(json!({"maxIterations": 10})),
                Node::new("ask", "llm").with_config(json!({"model": "gpt-4o"})),
                Node::new("out", "action"),
            ],
            edges: vec![
                Edge::new("e1", "t", "l"),
                Edge::new("e2", "l", "ask").from_port(LOOP_PORT),
                Edge::new("e3", "ask", "l"),
                Edge::new("e4", "l", "out").from_port(DONE_PORT),
            ],
            variables: vec![],
            settings: WorkflowSettings::default(),
        }
    }

    #[test]
    fn loop_scoped_llm_multiplies_by_iteration_cap() {
        let wf = workflow_with_loop_llm();
        let analysis = analyze(&wf.nodes, &wf.edges).unwrap();
        let estimate = estimate_max_cost(&wf, &analysis, &ModelRates::default());
        // 10 iterations at the gpt-4o rate.
        assert!((estimate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn preflight_rejects_over_budget() {
        let enforcer = BudgetEnforcer::new(Some(0.1));
        assert!(enforcer.preflight(0.05).await.is_ok());
        let err = enforcer.preflight(0.2).await;
        assert!(matches!(err, Err(EngineError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn charges_accrue_until_limit() {
        let enforcer = BudgetEnforcer::new(Some(0.05));
        enforcer.charge(0.02).await.unwrap();
        enforcer.charge(0.02).await.unwrap();
        let err = enforcer.charge(0.02).await;
        assert!(matches!(err, Err(EngineError::BudgetExceeded { .. })));
        assert!((enforcer.spent().await - 0.06).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disabled_budget_never_rejects() {
        let enforcer = BudgetEnforcer::new(None);
        assert!(!enforcer.enabled());
        assert!(enforcer.preflight(1e9).await.is_ok());
        assert!(enforcer.charge(1e9).await.is_ok());
    }
}
