//! The execution engine: orchestration of everything else.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ execute_run                                                │
//! │                                                            │
//! │  1. analyze graph (reject cycles)                          │
//! │  2. budget pre-flight (projected max vs remaining)         │
//! │  3. wave loop                                              │
//! │     ├─ skip propagation for unselected branches            │
//! │     ├─ dispatch ready nodes in parallel (bounded)          │
//! │     │    wrapper: pin check → credentials → templates      │
//! │     │             → executor (timeout, retries) → commit   │
//! │     ├─ loop nodes drain their scope in place               │
//! │     ├─ merges flush when nothing else can arrive           │
//! │     └─ suspension parks the run and releases workers       │
//! │  4. finalize (status, error workflows, flight recorder)    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine exclusively owns `RunState` mutation while a run is active.
//! Waits are full snapshots: on suspension the run is persisted and every
//! worker released; resume rehydrates the snapshot and re-enters the wave
//! loop after the suspended node.

use crate::analyzer::{analyze, DagAnalysis};
use crate::budget::{estimate_max_cost, BudgetEnforcer, ModelRates};
use crate::credentials::{
    resolve_credentials, CredentialCache, CredentialResolver, StaticCredentialResolver,
};
use crate::error::{EngineError, Result};
use crate::executors::{
    standard_registry, ActionHandler, CannedLlmClient, EchoActionHandler, LlmClient,
};
use crate::graph::{Edge, Node, OnErrorPolicy, WorkflowDefinition};
use crate::loops::LoopController;
use crate::merge::MergeCoordinator;
use crate::recorder::FlightRecorder;
use crate::registry::{ExecContext, ExecutionInput, ExecutorRegistry, NodeExecutor};
use crate::resolver::{items_of, resolve_config, seed_variables, ItemScope, ResolveScope};
use crate::retry::RetryPolicy;
use crate::suspend::{ResumeTarget, Resumption, SuspensionManager, WebhookDelivery, WebhookReply};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;
use wavefront_store::{
    GlobalContext, JsonSerializer, LoopContext, NodeMeta, NodeState, NodeStatus, PinMode,
    PinnedData, Run, RunError, RunState, RunStatus, Severity, StateStore, SuspensionRecord,
    TriggerInfo, TriggerKind, WaitKind,
};

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Intra-wave concurrency bound.
    pub max_concurrent_nodes: usize,
    /// Per-node timeout when the node config doesn't override it.
    pub default_node_timeout_ms: u64,
    /// Maximum sub-workflow nesting depth.
    pub max_recursion_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 5,
            default_node_timeout_ms: 300_000,
            max_recursion_depth: 5,
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user_id: String,
    pub workspace_id: String,
    pub env: String,
    pub is_test: bool,
    /// Budget limit in USD. `None` disables enforcement.
    pub budget_limit_usd: Option<f64>,
    /// Trigger-time variable overrides.
    pub variables: HashMap<String, Value>,
    /// Preassigned run id (used for child runs). Generated when absent.
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_budget(mut self, limit_usd: f64) -> Self {
        self.budget_limit_usd = Some(limit_usd);
        self
    }

    pub fn with_is_test(mut self, is_test: bool) -> Self {
        self.is_test = is_test;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// What a finished (or parked) run looks like to the caller.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub state: RunState,
    pub error: Option<RunError>,
    /// Output of the last completed node in topological order.
    pub output: Option<Value>,
}

/// Looks up workflow definitions for sub-workflow and error-workflow spawns.
#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition>;
}

/// Map-backed provider for tests and embedded use.
#[derive(Default)]
pub struct InMemoryWorkflowProvider {
    workflows: tokio::sync::RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, workflow: WorkflowDefinition) {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow);
    }
}

#[async_trait]
impl WorkflowProvider for InMemoryWorkflowProvider {
    async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().await.get(workflow_id).cloned()
    }
}

enum NodeOutcome {
    Completed,
    ErroredContinue,
    Suspended { suspension_id: String },
    WaitingForMerge,
    LoopContinue,
    Stop(RunError),
}

enum DriveOutcome {
    Completed,
    Suspended,
    Failed(RunError),
    Cancelled,
    TimedOut,
}

enum LoopDrive {
    Done,
    Suspended { suspension_id: String },
    Stop(RunError),
    Cancelled,
}

/// The orchestration core.
pub struct ExecutionEngine {
    store: Arc<dyn StateStore>,
    workflows: Arc<dyn WorkflowProvider>,
    registry: std::sync::RwLock<ExecutorRegistry>,
    suspensions: Arc<SuspensionManager>,
    merges: Arc<MergeCoordinator>,
    loops: Arc<LoopController>,
    credentials: Arc<dyn CredentialResolver>,
    rates: ModelRates,
    config: EngineConfig,
    cancel_flags: std::sync::Mutex<HashMap<String, Arc<AtomicBool>>>,
    credential_caches: std::sync::Mutex<HashMap<String, Arc<CredentialCache>>>,
    self_ref: std::sync::RwLock<Weak<ExecutionEngine>>,
}

impl ExecutionEngine {
    /// Engine with default collaborators: echo actions, canned LLM, empty
    /// credential vault.
    pub fn new(store: Arc<dyn StateStore>, workflows: Arc<dyn WorkflowProvider>) -> Arc<Self> {
        Self::with_collaborators(
            store,
            workflows,
            EngineConfig::default(),
            Arc::new(StaticCredentialResolver::default()),
            Arc::new(EchoActionHandler),
            Arc::new(CannedLlmClient),
        )
    }

    pub fn with_collaborators(
        store: Arc<dyn StateStore>,
        workflows: Arc<dyn WorkflowProvider>,
        config: EngineConfig,
        credentials: Arc<dyn CredentialResolver>,
        action_handler: Arc<dyn ActionHandler>,
        llm_client: Arc<dyn LlmClient>,
    ) -> Arc<Self> {
        let rates = ModelRates::default();
        let suspensions = Arc::new(SuspensionManager::new(
            store.clone(),
            Arc::new(JsonSerializer),
        ));
        let merges = Arc::new(MergeCoordinator::new(store.clone()));
        let loops = Arc::new(LoopController::new(store.clone()));
        let registry = standard_registry(
            suspensions.clone(),
            merges.clone(),
            loops.clone(),
            action_handler,
            llm_client,
            rates.clone(),
        );

        let engine = Arc::new(Self {
            store,
            workflows,
            registry: std::sync::RwLock::new(registry),
            suspensions,
            merges,
            loops,
            credentials,
            rates,
            config,
            cancel_flags: std::sync::Mutex::new(HashMap::new()),
            credential_caches: std::sync::Mutex::new(HashMap::new()),
            self_ref: std::sync::RwLock::new(Weak::new()),
        });
        *engine.self_ref.write().unwrap() = Arc::downgrade(&engine);
        engine
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .read()
            .unwrap()
            .upgrade()
            .ok_or_else(|| EngineError::Validation("engine has been dropped".into()))
    }

    /// Register an additional (or replacement) executor.
    pub fn register_executor(&self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.registry.write().unwrap().register(node_type, executor);
    }

    pub fn suspension_manager(&self) -> Arc<SuspensionManager> {
        self.suspensions.clone()
    }

    /// Spawn the periodic resumption worker. Returns its join handle and a
    /// shutdown notifier.
    pub fn start_resumption_worker(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (tokio::task::JoinHandle<()>, Arc<Notify>) {
        let shutdown = Arc::new(Notify::new());
        let target: Arc<dyn ResumeTarget> = self.clone();
        let worker =
            crate::suspend::ResumptionWorker::new(self.suspensions.clone(), target, interval);
        (tokio::spawn(worker.run(shutdown.clone())), shutdown)
    }

    // -- run lifecycle ------------------------------------------------------

    /// Execute a workflow to completion, failure, or its first suspension.
    pub async fn execute_run(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        trigger: TriggerInfo,
        options: RunOptions,
    ) -> Result<RunResult> {
        workflow.validate()?;
        let analysis = Arc::new(analyze(&workflow.nodes, &workflow.edges)?);

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let global = GlobalContext {
            user_id: options.user_id.clone(),
            workspace_id: options.workspace_id.clone(),
            env: if options.env.is_empty() {
                "production".to_string()
            } else {
                options.env.clone()
            },
            started_at: chrono::Utc::now(),
            is_test: options.is_test,
        };
        let mut state = RunState::new(global, trigger);
        state.variables = seed_variables(&workflow.variables, &options.variables);

        let run = Run::new(run_id.clone(), workflow.id.clone(), state);
        self.store.put_run(&run).await?;

        let recorder = FlightRecorder::new(
            run_id.clone(),
            workflow.settings.logging,
            self.store.clone(),
        );
        tracing::info!(run = %run_id, workflow = %workflow.id, "run created");
        recorder.info(None, "run created").await;

        // Error workflows are exempt from budget checks.
        let is_error_workflow = run.state.trigger.kind == TriggerKind::Error;
        let budget = BudgetEnforcer::new(if is_error_workflow {
            None
        } else {
            options.budget_limit_usd
        });
        if budget.enabled() {
            let projected = estimate_max_cost(workflow, &analysis, &self.rates);
            if let Err(err) = budget.preflight(projected).await {
                recorder
                    .error(None, format!("budget pre-flight rejected the run: {err}"))
                    .await;
                let error = RunError::new(err.code(), err.to_string());
                return self
                    .finish(
                        workflow,
                        &analysis,
                        &run_id,
                        DriveOutcome::Failed(error),
                        &recorder,
                        0,
                    )
                    .await;
            }
        }

        self.store
            .update_run_status(&run_id, RunStatus::Running)
            .await?;
        let cancel = self.cancel_flag(&run_id);
        let segment = Instant::now();
        let outcome = self
            .drive(workflow, &analysis, &run_id, &budget, &recorder, &cancel)
            .await?;
        self.finish(
            workflow,
            &analysis,
            &run_id,
            outcome,
            &recorder,
            segment.elapsed().as_millis() as u64,
        )
        .await
    }

    /// Resume a suspended run by suspension id. Idempotent: duplicate calls
    /// after resolution re-observe the original resolution and do nothing.
    pub async fn resume_run(
        self: &Arc<Self>,
        suspension_id: &str,
        payload: Value,
    ) -> Result<RunResult> {
        let resumption = self.suspensions.resume(suspension_id, payload).await?;
        self.resume_resumption(resumption).await
    }

    /// Deliver a webhook to a waiting run. Authentication failures leave the
    /// run suspended.
    pub async fn deliver_webhook(self: &Arc<Self>, delivery: &WebhookDelivery) -> Result<WebhookReply> {
        let (resumption, reply) = self.suspensions.handle_webhook(delivery).await?;
        self.resume_resumption(resumption).await?;
        Ok(reply)
    }

    /// Resolve a pending approval and continue the run.
    pub async fn resolve_approval(
        self: &Arc<Self>,
        correlation_id: &str,
        approved: bool,
        payload: Value,
    ) -> Result<RunResult> {
        let resumption = self
            .suspensions
            .resolve_approval(correlation_id, approved, payload)
            .await?;
        self.resume_resumption(resumption).await
    }

    /// Cancel a run. Propagates recursively into suspended child runs.
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        if let Some(flag) = self.cancel_flags.lock().unwrap().get(run_id) {
            flag.store(true, Ordering::Relaxed);
        }
        let cancelled = self.suspensions.cancel_for_run(run_id).await?;
        for record in &cancelled {
            if let Some(child) = &record.child_run_id {
                Box::pin(self.cancel_run(child)).await?;
            }
        }
        // A parked run has no active driver to notice the flag.
        if let Some(mut run) = self.store.get_run(run_id).await? {
            if run.status == RunStatus::Suspended || run.status == RunStatus::Pending {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(chrono::Utc::now());
                self.store.update_run(&run).await?;
                tracing::info!(run = run_id, "suspended run cancelled");
            }
        }
        Ok(())
    }

    async fn resume_resumption(self: &Arc<Self>, resumption: Resumption) -> Result<RunResult> {
        let record = resumption.record;
        let mut run = self
            .store
            .get_run(&record.run_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("run '{}' not found", record.run_id)))?;

        // A resolution can land while the suspending driver is still
        // finalizing (a fast child run, a prompt webhook). Give the run a
        // bounded window to park before treating the resume as stale.
        if run.status == RunStatus::Running {
            for _ in 0..250 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                run = self.load_run(&record.run_id).await?;
                if run.status != RunStatus::Running {
                    break;
                }
            }
        }
        if run.status != RunStatus::Suspended {
            // Raced a cancel, a timeout, or another resume that is already
            // driving; observe without re-entering.
            return Ok(RunResult {
                run_id: run.id.clone(),
                status: run.status,
                state: run.state.clone(),
                error: run.error.clone(),
                output: None,
            });
        }

        let workflow = self
            .workflows
            .get(&record.workflow_id)
            .await
            .ok_or_else(|| {
                EngineError::Validation(format!("workflow '{}' not found", record.workflow_id))
            })?;
        let analysis = Arc::new(analyze(&workflow.nodes, &workflow.edges)?);
        let recorder = FlightRecorder::new(
            run.id.clone(),
            workflow.settings.logging,
            self.store.clone(),
        );

        // Rehydrate: live state wins (siblings may have committed after the
        // snapshot was cut); the snapshot fills anything the live state
        // lost. Then settle the suspended node with its resolution.
        let mut state = run.state.clone();
        for (id, node_state) in resumption.snapshot.nodes {
            state.nodes.entry(id).or_insert(node_state);
        }
        for (key, value) in resumption.snapshot.variables {
            state.variables.entry(key).or_insert(value);
        }

        let prior_output = state
            .node_output(&record.node_id)
            .cloned()
            .unwrap_or(Value::Null);
        let output = resolution_output(&record, &resumption.payload, prior_output);
        match state.nodes.get_mut(&record.node_id) {
            Some(node_state) => {
                node_state.output = output;
                node_state.meta.settle(NodeStatus::Completed);
            }
            None => {
                let mut meta = NodeMeta::running();
                meta.settle(NodeStatus::Completed);
                state
                    .nodes
                    .insert(record.node_id.clone(), NodeState { output, meta });
            }
        }
        run.state = state;
        run.status = RunStatus::Running;
        self.store.update_run(&run).await?;
        recorder
            .info(
                Some(&record.node_id),
                format!("resumed from {:?} wait", record.kind),
            )
            .await;

        let budget = BudgetEnforcer::new(None);
        let cancel = self.cancel_flag(&run.id);
        let segment = Instant::now();
        let outcome = self
            .drive(&workflow, &analysis, &run.id, &budget, &recorder, &cancel)
            .await?;
        self.finish(
            &workflow,
            &analysis,
            &run.id,
            outcome,
            &recorder,
            segment.elapsed().as_millis() as u64,
        )
        .await
    }

    // -- wave loop ----------------------------------------------------------

    async fn drive(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        analysis: &Arc<DagAnalysis>,
        run_id: &str,
        budget: &BudgetEnforcer,
        recorder: &FlightRecorder,
        cancel: &Arc<AtomicBool>,
    ) -> Result<DriveOutcome> {
        let started = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(DriveOutcome::Cancelled);
            }
            let run = self.load_run(run_id).await?;
            let active = run.active_ms + started.elapsed().as_millis() as u64;
            if active > workflow.settings.max_execution_time {
                recorder
                    .error(None, "run exceeded its execution time limit")
                    .await;
                return Ok(DriveOutcome::TimedOut);
            }

            // A loop node left running means a resume landed mid-iteration.
            if let Some(loop_id) = analysis
                .loop_node_ids
                .iter()
                .find(|l| run.state.node_status(l) == NodeStatus::Running)
                .cloned()
            {
                match self
                    .drive_loop(workflow, analysis, run_id, &loop_id, budget, recorder, cancel)
                    .await?
                {
                    LoopDrive::Done => continue,
                    LoopDrive::Suspended { suspension_id } => {
                        self.after_suspend(run_id, &suspension_id).await?;
                        return Ok(DriveOutcome::Suspended);
                    }
                    LoopDrive::Stop(err) => return Ok(DriveOutcome::Failed(err)),
                    LoopDrive::Cancelled => return Ok(DriveOutcome::Cancelled),
                }
            }

            // Skip propagation: nodes whose every incoming edge is inactive.
            let mut skipped_any = false;
            for node in &workflow.nodes {
                if run.state.nodes.contains_key(&node.id) || analysis.in_loop_scope(&node.id) {
                    continue;
                }
                let preds = analysis.parents_of(&node.id);
                if preds.is_empty()
                    || !preds
                        .iter()
                        .all(|p| run.state.node_status(p).is_terminated())
                {
                    continue;
                }
                if should_skip(workflow, &run.state, &node.id) {
                    self.store
                        .put_node_state(run_id, &node.id, &NodeState::skipped())
                        .await?;
                    recorder.debug(Some(&node.id), "node skipped").await;
                    skipped_any = true;
                }
            }
            if skipped_any {
                continue;
            }

            // Ready set: pending nodes whose scheduling parents all settled.
            let ready: Vec<String> = workflow
                .nodes
                .iter()
                .filter(|n| {
                    !run.state.nodes.contains_key(&n.id)
                        && !analysis.in_loop_scope(&n.id)
                        && analysis
                            .parents_of(&n.id)
                            .iter()
                            .all(|p| run.state.node_status(p).is_terminated())
                })
                .map(|n| n.id.clone())
                .collect();

            if ready.is_empty() {
                // Merges that can never see another arrival flush with what
                // they have.
                let waiting: Vec<String> = run
                    .state
                    .nodes
                    .iter()
                    .filter(|(_, s)| s.meta.status == NodeStatus::WaitingForMerge)
                    .map(|(id, _)| id.clone())
                    .collect();
                if waiting.is_empty() {
                    // A sibling branch may have parked on a wait while
                    // another suspension was being handled.
                    if run
                        .state
                        .nodes
                        .values()
                        .any(|s| s.meta.status == NodeStatus::Suspended)
                    {
                        return Ok(DriveOutcome::Suspended);
                    }
                    break;
                }
                for merge_id in waiting {
                    let items = self.merges.flush(run_id, &merge_id).await?;
                    let mut node_state = run.state.nodes[&merge_id].clone();
                    node_state.output = json!(items);
                    node_state.meta.settle(NodeStatus::Completed);
                    self.store
                        .put_node_state(run_id, &merge_id, &node_state)
                        .await?;
                    recorder
                        .warn(
                            Some(&merge_id),
                            "merge timed out, continuing with arrived branches",
                        )
                        .await;
                }
                continue;
            }

            // Dispatch the wave, bounded by the concurrency limit.
            let limit = workflow
                .settings
                .parallel_limit
                .min(self.config.max_concurrent_nodes)
                .max(1);
            let semaphore = Arc::new(Semaphore::new(limit));
            let wave_futures: Vec<_> = ready
                .into_iter()
                .map(|node_id| {
                    let semaphore = semaphore.clone();
                    async move {
                        let _permit = semaphore.acquire().await;
                        let outcome = self
                            .dispatch_node(
                                workflow, analysis, run_id, &node_id, budget, recorder, None, None,
                            )
                            .await;
                        (node_id, outcome)
                    }
                })
                .collect();
            let results = futures::future::join_all(wave_futures).await;

            let mut suspended: Vec<String> = Vec::new();
            let mut stop: Option<RunError> = None;
            let mut loops_to_drive: Vec<String> = Vec::new();
            for (node_id, outcome) in results {
                match outcome? {
                    NodeOutcome::Completed
                    | NodeOutcome::ErroredContinue
                    | NodeOutcome::WaitingForMerge => {}
                    NodeOutcome::LoopContinue => loops_to_drive.push(node_id),
                    NodeOutcome::Suspended { suspension_id } => suspended.push(suspension_id),
                    NodeOutcome::Stop(err) => {
                        stop.get_or_insert(err);
                    }
                }
            }
            // Every suspension gets its bookkeeping (child launches) even
            // when several nodes parked in the same wave.
            for suspension_id in &suspended {
                self.after_suspend(run_id, suspension_id).await?;
            }
            if let Some(err) = stop {
                return Ok(DriveOutcome::Failed(err));
            }
            if !suspended.is_empty() {
                return Ok(DriveOutcome::Suspended);
            }
            for node_id in loops_to_drive {
                match self
                    .drive_loop(workflow, analysis, run_id, &node_id, budget, recorder, cancel)
                    .await?
                {
                    LoopDrive::Done => {}
                    LoopDrive::Suspended { suspension_id } => {
                        self.after_suspend(run_id, &suspension_id).await?;
                        return Ok(DriveOutcome::Suspended);
                    }
                    LoopDrive::Stop(err) => return Ok(DriveOutcome::Failed(err)),
                    LoopDrive::Cancelled => return Ok(DriveOutcome::Cancelled),
                }
            }
        }

        Ok(DriveOutcome::Completed)
    }

    /// Drain a loop's scope until the loop node exits through `done`.
    /// Iterations are strictly sequential.
    async fn drive_loop(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        analysis: &Arc<DagAnalysis>,
        run_id: &str,
        loop_node_id: &str,
        budget: &BudgetEnforcer,
        recorder: &FlightRecorder,
        cancel: &Arc<AtomicBool>,
    ) -> Result<LoopDrive> {
        let scope = analysis.loop_scopes.get(loop_node_id).ok_or_else(|| {
            EngineError::Validation(format!("loop node '{loop_node_id}' has no scope"))
        })?;
        let scope_order: Vec<String> = analysis
            .sorted_node_ids
            .iter()
            .filter(|id| scope.scope.contains(id.as_str()))
            .cloned()
            .collect();
        let mut feedback_ids: Vec<String> = scope.feedback_node_ids.iter().cloned().collect();
        feedback_ids.sort();

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(LoopDrive::Cancelled);
            }

            for node_id in &scope_order {
                let run = self.load_run(run_id).await?;
                if run.state.node_status(node_id).is_terminated() {
                    // Already ran this iteration (mid-iteration resume).
                    continue;
                }
                let loop_ctx = self.loops.current_context(run_id, loop_node_id).await?;
                match self
                    .dispatch_node(
                        workflow, analysis, run_id, node_id, budget, recorder, loop_ctx, None,
                    )
                    .await?
                {
                    NodeOutcome::Completed | NodeOutcome::ErroredContinue => {}
                    NodeOutcome::WaitingForMerge => {}
                    NodeOutcome::LoopContinue => {
                        // A nested loop drains before its parent advances.
                        match Box::pin(self.drive_loop(
                            workflow, analysis, run_id, node_id, budget, recorder, cancel,
                        ))
                        .await?
                        {
                            LoopDrive::Done => {}
                            other => return Ok(other),
                        }
                    }
                    NodeOutcome::Suspended { suspension_id } => {
                        return Ok(LoopDrive::Suspended { suspension_id })
                    }
                    NodeOutcome::Stop(err) => return Ok(LoopDrive::Stop(err)),
                }
            }

            // One iteration finished: hand the feedback outputs back to the
            // loop node.
            let run = self.load_run(run_id).await?;
            let feedbacks: Vec<Value> = feedback_ids
                .iter()
                .filter_map(|f| run.state.node_output(f).cloned())
                .collect();

            match self
                .dispatch_node(
                    workflow,
                    analysis,
                    run_id,
                    loop_node_id,
                    budget,
                    recorder,
                    None,
                    Some(feedbacks),
                )
                .await?
            {
                NodeOutcome::LoopContinue => continue,
                NodeOutcome::Completed => return Ok(LoopDrive::Done),
                NodeOutcome::ErroredContinue => return Ok(LoopDrive::Done),
                NodeOutcome::Suspended { suspension_id } => {
                    return Ok(LoopDrive::Suspended { suspension_id })
                }
                NodeOutcome::WaitingForMerge => {
                    return Ok(LoopDrive::Stop(
                        RunError::new("ExecutorError", "loop node cannot wait for a merge")
                            .at_node(loop_node_id),
                    ))
                }
                NodeOutcome::Stop(err) => return Ok(LoopDrive::Stop(err)),
            }
        }
    }

    // -- node dispatch ------------------------------------------------------

    /// The uniform wrapper around every executor invocation: pinned data,
    /// credential resolution, template resolution, timeout, retries, error
    /// policy, cost accounting, state commit. Loop re-invocations pass
    /// through here too and count as discrete node executions.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_node(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        analysis: &Arc<DagAnalysis>,
        run_id: &str,
        node_id: &str,
        budget: &BudgetEnforcer,
        recorder: &FlightRecorder,
        loop_ctx: Option<LoopContext>,
        iteration_results: Option<Vec<Value>>,
    ) -> Result<NodeOutcome> {
        let node = workflow
            .node(node_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown node '{node_id}'")))?;
        let run = self.load_run(run_id).await?;
        recorder.debug(Some(node_id), "node started").await;

        let mut meta = NodeMeta::running();
        self.store
            .put_node_state(
                run_id,
                node_id,
                &NodeState {
                    output: Value::Null,
                    meta: meta.clone(),
                },
            )
            .await?;

        // Pinned output short-circuits real execution.
        let pin = self
            .store
            .find_pin(&workflow.id, node_id, &run.state.global.user_id)
            .await?;
        if let Some(pin) = &pin {
            let applies = pin.mode == PinMode::Always
                || (pin.mode == PinMode::Development && run.state.global.is_test);
            if applies {
                return self
                    .complete_with_pin(workflow, run_id, node_id, pin, meta, recorder)
                    .await;
            }
        }

        // Sub-workflow nesting is bounded before the child ever spawns.
        if node.node_type == "executeWorkflow" {
            let depth = self.recursion_depth(run_id).await?;
            if depth + 1 > self.config.max_recursion_depth {
                let err = EngineError::RecursionLimit {
                    limit: self.config.max_recursion_depth,
                };
                recorder.error(Some(node_id), err.to_string()).await;
                meta.settle(NodeStatus::Error);
                meta.error = Some(err.to_string());
                self.store
                    .put_node_state(
                        run_id,
                        node_id,
                        &NodeState {
                            output: Value::Null,
                            meta,
                        },
                    )
                    .await?;
                return Ok(NodeOutcome::Stop(
                    RunError::new(err.code(), err.to_string()).at_node(node_id),
                ));
            }
        }

        // Credentials, then templates.
        let cache = self.credential_cache(run_id);
        let with_credentials =
            match resolve_credentials(&node.config, &*self.credentials, &cache).await {
                Ok(config) => config,
                Err(err) => {
                    return self
                        .fail_node(
                            workflow, run_id, node, meta, 0, err.to_string(), recorder,
                        )
                        .await;
                }
            };

        let inputs = assemble_inputs(workflow, &run.state, node_id);
        let items = items_of(&inputs);
        let mut scope = ResolveScope::new(&run.state).with_item(ItemScope {
            items: &items,
            index: 0,
        });
        if let Some(ctx) = &loop_ctx {
            scope = scope.with_loop(ctx);
        }
        let (resolved_config, warnings) = resolve_config(&with_credentials, &scope);
        for warning in &warnings {
            recorder.warn(Some(node_id), warning.clone()).await;
        }

        let resolved_node = Node {
            config: resolved_config,
            ..node.clone()
        };
        let exec_input = ExecutionInput {
            node: resolved_node,
            inputs,
            context: ExecContext {
                run_id: run_id.to_string(),
                workflow_id: workflow.id.clone(),
                user_id: run.state.global.user_id.clone(),
                is_test: run.state.global.is_test,
                snapshot: run.state.clone(),
                analysis: analysis.clone(),
                settings: workflow.settings.clone(),
                loop_context: loop_ctx,
                iteration_results,
                pending_node_ids: pending_downstream(analysis, &run.state, node_id),
            },
        };

        let executor = self.registry.read().unwrap().get(&node.node_type);
        let runtime_config = node.runtime_config();
        let policy = if is_retryable(&node.node_type) {
            RetryPolicy::for_node(&runtime_config, &workflow.settings)
        } else {
            RetryPolicy::new(1)
        };
        let timeout_ms = runtime_config
            .timeout
            .unwrap_or(self.config.default_node_timeout_ms);

        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut output = None;
        while attempts < policy.max_attempts {
            attempts += 1;
            let attempt = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                executor.execute(exec_input.clone()),
            )
            .await;
            match attempt {
                Err(_) => {
                    last_error = Some(format!("node timed out after {timeout_ms}ms"));
                }
                Ok(Err(err)) => {
                    last_error = Some(err.to_string());
                }
                Ok(Ok(out)) if !out.success => {
                    last_error = Some(
                        out.error
                            .clone()
                            .unwrap_or_else(|| "executor reported failure".to_string()),
                    );
                }
                Ok(Ok(out)) => {
                    output = Some(out);
                    break;
                }
            }
            if attempts < policy.max_attempts {
                recorder
                    .warn(
                        Some(node_id),
                        format!(
                            "attempt {attempts} failed ({}), retrying",
                            last_error.as_deref().unwrap_or("unknown")
                        ),
                    )
                    .await;
                tokio::time::sleep(policy.delay(attempts)).await;
            }
        }
        meta.retry_count = attempts.saturating_sub(1);

        let Some(output) = output else {
            let message = last_error.unwrap_or_else(|| "unknown executor failure".to_string());
            return self
                .fail_node(
                    workflow,
                    run_id,
                    node,
                    meta,
                    attempts.saturating_sub(1),
                    message,
                    recorder,
                )
                .await;
        };

        if let Some(cost) = output.meta.cost_usd {
            if let Err(err) = budget.charge(cost).await {
                recorder.error(Some(node_id), err.to_string()).await;
                meta.settle(NodeStatus::Error);
                meta.error = Some(err.to_string());
                self.store
                    .put_node_state(
                        run_id,
                        node_id,
                        &NodeState {
                            output: output.data,
                            meta,
                        },
                    )
                    .await?;
                return Ok(NodeOutcome::Stop(
                    RunError::new(err.code(), err.to_string()).at_node(node_id),
                ));
            }
        }

        meta.output_path = output.meta.output_path.clone();

        if output.meta.suspended {
            meta.status = NodeStatus::Suspended;
            self.store
                .put_node_state(
                    run_id,
                    node_id,
                    &NodeState {
                        output: output.data,
                        meta,
                    },
                )
                .await?;
            let suspension_id = output.meta.suspension_id.clone().ok_or_else(|| {
                EngineError::Suspension("executor suspended without a suspension id".into())
            })?;
            return Ok(NodeOutcome::Suspended { suspension_id });
        }

        if output.meta.waiting_for_merge {
            meta.status = NodeStatus::WaitingForMerge;
            self.store
                .put_node_state(
                    run_id,
                    node_id,
                    &NodeState {
                        output: Value::Null,
                        meta,
                    },
                )
                .await?;
            return Ok(NodeOutcome::WaitingForMerge);
        }

        if output.meta.continue_loop {
            // Loop node stays running while its scope iterates.
            self.store
                .put_node_state(
                    run_id,
                    node_id,
                    &NodeState {
                        output: output.data,
                        meta,
                    },
                )
                .await?;
            return Ok(NodeOutcome::LoopContinue);
        }

        meta.settle(NodeStatus::Completed);
        self.store
            .put_node_state(
                run_id,
                node_id,
                &NodeState {
                    output: output.data,
                    meta,
                },
            )
            .await?;
        recorder.info(Some(node_id), "node completed").await;
        Ok(NodeOutcome::Completed)
    }

    async fn complete_with_pin(
        &self,
        workflow: &WorkflowDefinition,
        run_id: &str,
        node_id: &str,
        pin: &PinnedData,
        mut meta: NodeMeta,
        recorder: &FlightRecorder,
    ) -> Result<NodeOutcome> {
        meta.used_pinned_data = true;
        meta.pin_id = Some(pin.id.clone());
        meta.settle(NodeStatus::Completed);
        self.store
            .put_node_state(
                run_id,
                node_id,
                &NodeState {
                    output: pin.output.clone(),
                    meta,
                },
            )
            .await?;
        self.store
            .record_pin_use(&workflow.id, node_id, &pin.user_id)
            .await?;
        recorder
            .info(Some(node_id), "pinned output substituted for execution")
            .await;
        Ok(NodeOutcome::Completed)
    }

    /// Apply the node's `onError` policy to a final failure.
    #[allow(clippy::too_many_arguments)]
    async fn fail_node(
        &self,
        workflow: &WorkflowDefinition,
        run_id: &str,
        node: &Node,
        mut meta: NodeMeta,
        retries: u32,
        message: String,
        recorder: &FlightRecorder,
    ) -> Result<NodeOutcome> {
        meta.retry_count = retries;
        // Per-node policy first, then the workflow's errorHandling setting.
        // `compensate` stops the run; the compensation is the error workflow
        // dispatched at finalization.
        let policy = node.runtime_config().on_error.unwrap_or(
            match workflow.settings.error_handling {
                crate::graph::ErrorHandlingMode::Continue => OnErrorPolicy::Continue,
                _ => OnErrorPolicy::Stop,
            },
        );

        if policy == OnErrorPolicy::PinFallback {
            let run = self.load_run(run_id).await?;
            let pin = self
                .store
                .find_pin(&workflow.id, &node.id, &run.state.global.user_id)
                .await?;
            if let Some(pin) = pin.filter(|p| p.mode == PinMode::OnError) {
                recorder
                    .warn(
                        Some(&node.id),
                        format!("execution failed ({message}), substituting on-error pin"),
                    )
                    .await;
                return self
                    .complete_with_pin(workflow, run_id, &node.id, &pin, meta, recorder)
                    .await;
            }
        }

        meta.settle(NodeStatus::Error);
        meta.error = Some(message.clone());
        self.store
            .put_node_state(
                run_id,
                &node.id,
                &NodeState {
                    output: json!({"error": message.clone()}),
                    meta,
                },
            )
            .await?;

        match policy {
            OnErrorPolicy::Continue => {
                recorder
                    .warn(
                        Some(&node.id),
                        format!("node failed ({message}), continuing per policy"),
                    )
                    .await;
                Ok(NodeOutcome::ErroredContinue)
            }
            _ => {
                recorder
                    .error(Some(&node.id), format!("node failed: {message}"))
                    .await;
                Ok(NodeOutcome::Stop(
                    RunError::new("ExecutorError", message).at_node(&node.id),
                ))
            }
        }
    }

    // -- finalization -------------------------------------------------------

    async fn finish(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        analysis: &Arc<DagAnalysis>,
        run_id: &str,
        outcome: DriveOutcome,
        recorder: &FlightRecorder,
        segment_elapsed_ms: u64,
    ) -> Result<RunResult> {
        if matches!(outcome, DriveOutcome::Completed) {
            // Every node ends the run in a definite state: anything never
            // reached is recorded as skipped.
            let run = self.load_run(run_id).await?;
            for node in &workflow.nodes {
                if !run.state.nodes.contains_key(&node.id) {
                    self.store
                        .put_node_state(run_id, &node.id, &NodeState::skipped())
                        .await?;
                }
            }
        }

        let mut run = self.load_run(run_id).await?;
        run.active_ms += segment_elapsed_ms;

        let status = match &outcome {
            DriveOutcome::Completed => RunStatus::Completed,
            DriveOutcome::Suspended => RunStatus::Suspended,
            DriveOutcome::Failed(err) => {
                run.error = Some(err.clone());
                RunStatus::Failed
            }
            DriveOutcome::Cancelled => RunStatus::Cancelled,
            DriveOutcome::TimedOut => {
                run.error = Some(RunError::new(
                    "Timeout",
                    format!(
                        "run exceeded its {}ms execution limit",
                        workflow.settings.max_execution_time
                    ),
                ));
                RunStatus::Timeout
            }
        };
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(chrono::Utc::now());
        }

        match status {
            RunStatus::Suspended => recorder.info(None, "run suspended").await,
            RunStatus::Completed => recorder.info(None, "run completed").await,
            _ => {
                recorder
                    .error(
                        None,
                        format!(
                            "run finished {:?}: {}",
                            status,
                            run.error
                                .as_ref()
                                .map(|e| e.message.clone())
                                .unwrap_or_default()
                        ),
                    )
                    .await
            }
        }
        self.store.update_run(&run).await?;

        if status.is_terminal() {
            self.cancel_flags.lock().unwrap().remove(run_id);
            // Credential cache is run-scoped.
            self.credential_caches.lock().unwrap().remove(run_id);
            self.notify_parent_if_child(run_id, &run).await;
        }

        if status == RunStatus::Failed {
            if let Some(error) = run.error.clone() {
                self.dispatch_error_workflows(workflow, &run, &error).await;
            }
        }

        let output = last_completed_output(analysis, &run.state);
        Ok(RunResult {
            run_id: run.id.clone(),
            status,
            state: run.state,
            error: run.error,
            output,
        })
    }

    /// If this run is a child of a suspended parent, resolve the parent's
    /// suspension with our terminal result.
    async fn notify_parent_if_child(self: &Arc<Self>, run_id: &str, run: &Run) {
        let waiting_parent = match self.store.find_suspension_by_child_run(run_id).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(run = run_id, error = %err, "parent lookup failed");
                return;
            }
        };
        if waiting_parent.is_none() {
            return;
        }

        let status = match run.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
            _ => return,
        };
        let output = run
            .state
            .nodes
            .values()
            .filter(|s| s.meta.status == NodeStatus::Completed)
            .max_by_key(|s| s.meta.completed_at)
            .map(|s| s.output.clone())
            .unwrap_or(Value::Null);

        let engine = match self.arc() {
            Ok(engine) => engine,
            Err(_) => return,
        };
        match engine
            .suspensions
            .complete_subworkflow(run_id, status, output)
            .await
        {
            Ok(resumption) => {
                // Detached: the parent's continuation must not nest inside
                // the child's finalization.
                tokio::spawn(resume_detached(engine, resumption));
            }
            Err(err) => {
                tracing::warn!(child = run_id, error = %err, "sub-workflow completion not delivered");
            }
        }
    }

    async fn dispatch_error_workflows(
        self: &Arc<Self>,
        workflow: &WorkflowDefinition,
        run: &Run,
        error: &RunError,
    ) {
        // Error workflows cannot trigger further error workflows.
        if run.state.trigger.kind == TriggerKind::Error {
            return;
        }
        let configs = match self.store.error_workflows_for(&workflow.id).await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(workflow = %workflow.id, error = %err, "error-workflow lookup failed");
                return;
            }
        };
        let node_type = error
            .node_id
            .as_deref()
            .and_then(|id| workflow.node(id))
            .map(|n| n.node_type.clone());

        for config in configs {
            if !config.matches(node_type.as_deref(), &error.code, Severity::Error) {
                continue;
            }
            let Some(error_workflow) = self.workflows.get(&config.error_workflow_id).await else {
                tracing::warn!(
                    error_workflow = %config.error_workflow_id,
                    "configured error workflow not found"
                );
                continue;
            };
            let payload = json!({
                "$error": {
                    "message": error.message,
                    "code": error.code,
                    "nodeId": error.node_id,
                },
                "$workflow": {"id": workflow.id, "name": workflow.name},
                "$execution": {"id": run.id},
            });
            let trigger = TriggerInfo::new(TriggerKind::Error, payload);
            let options = RunOptions {
                user_id: run.state.global.user_id.clone(),
                workspace_id: run.state.global.workspace_id.clone(),
                env: run.state.global.env.clone(),
                is_test: run.state.global.is_test,
                ..Default::default()
            };
            let engine = match self.arc() {
                Ok(engine) => engine,
                Err(_) => return,
            };
            tracing::info!(
                failed_run = %run.id,
                error_workflow = %error_workflow.id,
                "spawning error workflow"
            );
            tokio::spawn(run_detached(engine, error_workflow, trigger, options));
        }
    }

    // -- suspension plumbing ------------------------------------------------

    /// Post-suspension bookkeeping: persist the suspended status and, for
    /// sub-workflow waits, launch the child run.
    async fn after_suspend(self: &Arc<Self>, run_id: &str, suspension_id: &str) -> Result<()> {
        let record = self
            .store
            .get_suspension(suspension_id)
            .await?
            .ok_or_else(|| {
                EngineError::Suspension(format!("suspension '{suspension_id}' vanished"))
            })?;

        if record.kind == WaitKind::Subworkflow {
            self.launch_child(&record).await?;
        }
        Ok(())
    }

    async fn launch_child(self: &Arc<Self>, record: &SuspensionRecord) -> Result<()> {
        let (Some(child_run_id), Some(child_workflow_id)) =
            (record.child_run_id.clone(), record.child_workflow_id.clone())
        else {
            return Err(EngineError::Suspension(
                "subworkflow suspension lacks child identifiers".into(),
            ));
        };
        let Some(child_workflow) = self.workflows.get(&child_workflow_id).await else {
            return Err(EngineError::Validation(format!(
                "child workflow '{child_workflow_id}' not found"
            )));
        };

        let trigger = TriggerInfo::new(
            TriggerKind::Api,
            record.child_input.clone().unwrap_or(Value::Null),
        );
        let options = RunOptions {
            user_id: record.stored_state.global.user_id.clone(),
            workspace_id: record.stored_state.global.workspace_id.clone(),
            env: record.stored_state.global.env.clone(),
            is_test: record.stored_state.global.is_test,
            run_id: Some(child_run_id.clone()),
            ..Default::default()
        };
        let engine = self.arc()?;
        tracing::info!(
            parent = %record.run_id,
            child = %child_run_id,
            workflow = %child_workflow_id,
            "launching sub-workflow"
        );
        // Terminal notification of the parent happens inside the child's
        // finalization.
        tokio::spawn(run_detached(engine, child_workflow, trigger, options));
        Ok(())
    }

    /// Nesting depth of a run, derived from the chain of sub-workflow
    /// suspensions above it.
    async fn recursion_depth(&self, run_id: &str) -> Result<u32> {
        let mut depth = 0;
        let mut current = run_id.to_string();
        while let Some(record) = self.store.find_suspension_by_child_run(&current).await? {
            depth += 1;
            current = record.run_id.clone();
            if depth > 64 {
                break;
            }
        }
        Ok(depth)
    }

    // -- small helpers ------------------------------------------------------

    async fn load_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("run '{run_id}' not found")))
    }

    fn cancel_flag(&self, run_id: &str) -> Arc<AtomicBool> {
        self.cancel_flags
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn credential_cache(&self, run_id: &str) -> Arc<CredentialCache> {
        self.credential_caches
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(CredentialCache::new()))
            .clone()
    }
}

#[async_trait]
impl ResumeTarget for ExecutionEngine {
    async fn resume_suspended(&self, suspension_id: &str, payload: Value) -> Result<()> {
        let engine = self.arc()?;
        engine.resume_run(suspension_id, payload).await?;
        Ok(())
    }

    async fn fail_suspended(&self, record: &SuspensionRecord, reason: String) -> Result<()> {
        let engine = self.arc()?;
        let Some(mut run) = engine.store.get_run(&record.run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        engine.store.cancel_suspension(&record.id).await?;
        run.status = RunStatus::Failed;
        run.error = Some(RunError::new("Timeout", reason).at_node(&record.node_id));
        run.completed_at = Some(chrono::Utc::now());
        engine.store.update_run(&run).await?;
        tracing::warn!(run = %run.id, node = %record.node_id, "suspended run failed on wait timeout");

        if let Some(workflow) = engine.workflows.get(&record.workflow_id).await {
            if let Some(error) = run.error.clone() {
                engine
                    .dispatch_error_workflows(&workflow, &run, &error)
                    .await;
            }
        }
        Ok(())
    }
}

/// Run a workflow as a detached task. Boxed so spawned runs never nest their
/// future type inside the spawning run's future.
fn run_detached(
    engine: Arc<ExecutionEngine>,
    workflow: WorkflowDefinition,
    trigger: TriggerInfo,
    options: RunOptions,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(err) = engine.execute_run(&workflow, trigger, options).await {
            tracing::error!(workflow = %workflow.id, error = %err, "detached run failed");
        }
    })
}

/// Resume a run as a detached task. Boxed for the same reason as
/// [`run_detached`].
fn resume_detached(
    engine: Arc<ExecutionEngine>,
    resumption: Resumption,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        let run_id = resumption.record.run_id.clone();
        if let Err(err) = engine.resume_resumption(resumption).await {
            tracing::error!(run = %run_id, error = %err, "detached resume failed");
        }
    })
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Which port an edge listens on. Unlabeled edges out of a condition node
/// follow the convention: first edge is the `true` branch, second `false`.
fn edge_port(workflow: &WorkflowDefinition, edge: &Edge) -> Option<String> {
    if let Some(port) = &edge.source_port {
        return Some(port.clone());
    }
    let source = workflow.node(&edge.source)?;
    if source.node_type == "condition" {
        let position = workflow
            .edges
            .iter()
            .filter(|e| e.source == edge.source)
            .position(|e| e.id == edge.id)?;
        return match position {
            0 => Some("true".to_string()),
            1 => Some("false".to_string()),
            _ => None,
        };
    }
    None
}

/// Whether an edge currently carries data: its source has settled usefully
/// and the source's output port matches.
fn edge_active(workflow: &WorkflowDefinition, state: &RunState, edge: &Edge) -> bool {
    let Some(parent) = state.nodes.get(&edge.source) else {
        return false;
    };
    match parent.meta.status {
        NodeStatus::Skipped => false,
        NodeStatus::Completed | NodeStatus::Error => {
            match (parent.meta.output_path.as_deref(), edge_port(workflow, edge)) {
                (Some(chosen), Some(port)) if chosen != port => false,
                _ => true,
            }
        }
        // A running loop node feeds its scope the current batch.
        NodeStatus::Running => workflow
            .node(&edge.source)
            .map(|n| n.is_loop())
            .unwrap_or(false),
        _ => false,
    }
}

/// A node is skipped when it has incoming edges and none of them is active.
fn should_skip(workflow: &WorkflowDefinition, state: &RunState, node_id: &str) -> bool {
    let mut has_incoming = false;
    for edge in workflow.edges.iter().filter(|e| e.target == node_id) {
        has_incoming = true;
        if edge_active(workflow, state, edge) {
            return false;
        }
    }
    has_incoming
}

/// Resolved inputs for a node: one parent's output directly, or a map keyed
/// by source node id when several parents contribute.
fn assemble_inputs(workflow: &WorkflowDefinition, state: &RunState, node_id: &str) -> Value {
    let mut contributions: Vec<(String, Value)> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for edge in workflow.edges.iter().filter(|e| e.target == node_id) {
        if !seen.insert(edge.source.as_str()) {
            continue;
        }
        if edge_active(workflow, state, edge) {
            if let Some(output) = state.node_output(&edge.source) {
                contributions.push((edge.source.clone(), output.clone()));
            }
        }
    }

    match contributions.len() {
        0 => Value::Null,
        1 => contributions.remove(0).1,
        _ => Value::Object(
            contributions
                .into_iter()
                .map(|(id, v)| (id, v))
                .collect::<serde_json::Map<_, _>>(),
        ),
    }
}

/// Nodes still pending downstream of a node, for suspension records.
fn pending_downstream(
    analysis: &DagAnalysis,
    state: &RunState,
    node_id: &str,
) -> Vec<String> {
    let mut pending = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
    while let Some(current) = queue.pop_front() {
        if let Some(successors) = analysis.successors.get(current) {
            for succ in successors {
                if visited.insert(succ.as_str()) {
                    if !state.node_status(succ).is_terminated() {
                        pending.push(succ.clone());
                    }
                    queue.push_back(succ.as_str());
                }
            }
        }
    }
    pending
}

/// The output of the topologically last completed node.
fn last_completed_output(analysis: &DagAnalysis, state: &RunState) -> Option<Value> {
    analysis
        .sorted_node_ids
        .iter()
        .rev()
        .find_map(|id| match state.nodes.get(id) {
            Some(node) if node.meta.status == NodeStatus::Completed => Some(node.output.clone()),
            _ => None,
        })
}

/// Families subject to the retry policy. Control-flow and pure nodes never
/// retry: retrying a wait would mint duplicate suspensions.
fn is_retryable(node_type: &str) -> bool {
    !matches!(
        node_type,
        "trigger"
            | "condition"
            | "merge"
            | "wait"
            | "webhookWait"
            | "approval"
            | "splitInBatches"
            | "loop"
            | "executeWorkflow"
            | "transform"
            | "set"
    )
}

/// How a suspension's resolution becomes the suspended node's output.
fn resolution_output(record: &SuspensionRecord, payload: &Value, prior_output: Value) -> Value {
    match record.kind {
        // Poll-driven waits pass their parked input through unless the
        // timeout policy injected a payload.
        WaitKind::Timer | WaitKind::Datetime | WaitKind::Condition => {
            if payload.is_null() {
                prior_output
            } else {
                payload.clone()
            }
        }
        WaitKind::Webhook | WaitKind::Approval | WaitKind::Subworkflow => payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WorkflowSettings;
    use serde_json::json;
    use wavefront_store::{NodeMeta, TriggerInfo};

    fn workflow_with_condition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "branching".into(),
            version: 1,
            nodes: vec![
                Node::new("t", "trigger"),
                Node::new("c", "condition"),
                Node::new("a", "action"),
                Node::new("b", "action"),
            ],
            edges: vec![
                Edge::new("e1", "t", "c"),
                Edge::new("e2", "c", "a"),
                Edge::new("e3", "c", "b"),
            ],
            variables: vec![],
            settings: WorkflowSettings::default(),
        }
    }

    fn state_with(nodes: Vec<(&str, NodeStatus, Option<&str>)>) -> RunState {
        let mut state = RunState::new(GlobalContext::default(), TriggerInfo::manual(json!({})));
        for (id, status, path) in nodes {
            let mut meta = NodeMeta::running();
            meta.status = status;
            meta.output_path = path.map(|p| p.to_string());
            state.nodes.insert(
                id.to_string(),
                NodeState {
                    output: json!({"from": id}),
                    meta,
                },
            );
        }
        state
    }

    #[test]
    fn unlabeled_condition_edges_follow_index_convention() {
        let wf = workflow_with_condition();
        let e2 = wf.edges.iter().find(|e| e.id == "e2").unwrap();
        let e3 = wf.edges.iter().find(|e| e.id == "e3").unwrap();
        assert_eq!(edge_port(&wf, e2).as_deref(), Some("true"));
        assert_eq!(edge_port(&wf, e3).as_deref(), Some("false"));
    }

    #[test]
    fn false_branch_is_skipped() {
        let wf = workflow_with_condition();
        let state = state_with(vec![
            ("t", NodeStatus::Completed, None),
            ("c", NodeStatus::Completed, Some("true")),
        ]);
        assert!(!should_skip(&wf, &state, "a"));
        assert!(should_skip(&wf, &state, "b"));
    }

    #[test]
    fn skipped_parent_propagates() {
        let wf = WorkflowDefinition {
            id: "wf".into(),
            name: "chain".into(),
            version: 1,
            nodes: vec![
                Node::new("x", "action"),
                Node::new("y", "action"),
            ],
            edges: vec![Edge::new("e1", "x", "y")],
            variables: vec![],
            settings: WorkflowSettings::default(),
        };
        let state = state_with(vec![("x", NodeStatus::Skipped, None)]);
        assert!(should_skip(&wf, &state, "y"));
    }

    #[test]
    fn single_parent_input_is_direct() {
        let wf = workflow_with_condition();
        let state = state_with(vec![("t", NodeStatus::Completed, None)]);
        let inputs = assemble_inputs(&wf, &state, "c");
        assert_eq!(inputs, json!({"from": "t"}));
    }

    #[test]
    fn multi_parent_inputs_keyed_by_source() {
        let wf = WorkflowDefinition {
            id: "wf".into(),
            name: "join".into(),
            version: 1,
            nodes: vec![
                Node::new("a", "action"),
                Node::new("b", "action"),
                Node::new("m", "merge"),
            ],
            edges: vec![Edge::new("e1", "a", "m"), Edge::new("e2", "b", "m")],
            variables: vec![],
            settings: WorkflowSettings::default(),
        };
        let state = state_with(vec![
            ("a", NodeStatus::Completed, None),
            ("b", NodeStatus::Completed, None),
        ]);
        let inputs = assemble_inputs(&wf, &state, "m");
        assert_eq!(inputs["a"], json!({"from": "a"}));
        assert_eq!(inputs["b"], json!({"from": "b"}));
    }

    #[test]
    fn retryable_families() {
        assert!(is_retryable("http"));
        assert!(is_retryable("llm"));
        assert!(is_retryable("some-vendor-node"));
        assert!(!is_retryable("wait"));
        assert!(!is_retryable("splitInBatches"));
        assert!(!is_retryable("trigger"));
    }
}
