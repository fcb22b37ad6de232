//! Built-in executor families.
//!
//! | family | behavior |
//! |---|---|
//! | `trigger` | pass-through of the trigger payload |
//! | `action` / `http` / `email` / `database` | side-effecting, routed through an [`ActionHandler`] |
//! | `llm` | completion via an [`LlmClient`], reports token usage and cost |
//! | `condition` | boolean routing with `true`/`false` output ports |
//! | `transform` / `set` | pure item reshaping |
//! | `merge` | delegates to the merge coordinator |
//! | `wait` / `webhookWait` / `approval` | delegate to the suspension manager |
//! | `splitInBatches` | delegates to the loop controller |
//! | `executeWorkflow` | suspends on a child run |
//! | anything else | the `custom` fallback at nominal cost |

mod action;
mod condition;
mod control;
mod custom;
mod llm;
mod transform;
mod trigger;

pub use action::{ActionExecutor, ActionHandler, EchoActionHandler};
pub use condition::ConditionExecutor;
pub use control::{
    ApprovalExecutor, ExecuteWorkflowExecutor, MergeExecutor, SplitInBatchesExecutor,
    WaitExecutor, WebhookWaitExecutor,
};
pub use custom::CustomExecutor;
pub use llm::{CannedLlmClient, LlmClient, LlmExecutor, LlmResponse};
pub use transform::TransformExecutor;
pub use trigger::TriggerExecutor;

use crate::budget::ModelRates;
use crate::loops::LoopController;
use crate::merge::MergeCoordinator;
use crate::registry::ExecutorRegistry;
use crate::suspend::SuspensionManager;
use std::sync::Arc;

/// Build the registry with every built-in family wired up.
pub fn standard_registry(
    suspensions: Arc<SuspensionManager>,
    merges: Arc<MergeCoordinator>,
    loops: Arc<LoopController>,
    action_handler: Arc<dyn ActionHandler>,
    llm_client: Arc<dyn LlmClient>,
    rates: ModelRates,
) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new(Arc::new(CustomExecutor));

    registry.register("trigger", Arc::new(TriggerExecutor));
    for family in ["action", "http", "email", "database"] {
        registry.register(
            family,
            Arc::new(ActionExecutor::new(family, action_handler.clone())),
        );
    }
    registry.register("llm", Arc::new(LlmExecutor::new(llm_client, rates)));
    registry.register("condition", Arc::new(ConditionExecutor));
    registry.register("transform", Arc::new(TransformExecutor));
    registry.register("set", Arc::new(TransformExecutor));
    registry.register("merge", Arc::new(MergeExecutor::new(merges)));
    registry.register("wait", Arc::new(WaitExecutor::new(suspensions.clone())));
    registry.register(
        "webhookWait",
        Arc::new(WebhookWaitExecutor::new(suspensions.clone())),
    );
    registry.register(
        "approval",
        Arc::new(ApprovalExecutor::new(suspensions.clone())),
    );
    registry.register(
        "splitInBatches",
        Arc::new(SplitInBatchesExecutor::new(loops)),
    );
    registry.register(
        "executeWorkflow",
        Arc::new(ExecuteWorkflowExecutor::new(suspensions)),
    );

    registry
}
