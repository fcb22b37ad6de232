//! Suspension management: durable waits and resumption.
//!
//! A wait is not a coroutine suspension. It is a full state snapshot written
//! to durable storage; every worker is released and the run survives process
//! restarts and multi-day delays. Resume loads the snapshot, reapplies the
//! resolution payload, and the engine re-enters the wave loop after the
//! suspended node.
//!
//! Wait kinds and what resumes them:
//!
//! | kind        | resumes when                                            |
//! |-------------|---------------------------------------------------------|
//! | timer       | `now >= started + duration`                             |
//! | datetime    | `now >= target`                                         |
//! | webhook     | authenticated request hits the wait route               |
//! | approval    | the approval correlation id resolves                    |
//! | subworkflow | the child run reaches a terminal status                 |
//! | condition   | periodic re-evaluation of an expression yields true     |
//!
//! Timer, datetime, and condition waits are found by the
//! [`ResumptionWorker`]'s periodic scan; the rest are event-driven.
//! Resumption is idempotent by suspension id: a duplicate resume returns the
//! original resolution without re-triggering anything.

use crate::error::{EngineError, Result};
use crate::resolver::{resolve_bool, ResolveScope};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;
use wavefront_store::{
    NodeId, RunId, RunState, SnapshotSerializer, StateStore, StoreError, SuspensionRecord,
    SuspensionStatus, TimeoutAction, WaitKind,
};

/// Fallback timeout for waits that don't configure one: 24 hours.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
/// Default re-evaluation interval for condition waits.
const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

/// Identity of the wait being started.
#[derive(Debug, Clone)]
pub struct WaitContext {
    pub run_id: RunId,
    pub workflow_id: String,
    pub node_id: NodeId,
    /// Nodes still pending downstream of the suspended node.
    pub pending_node_ids: Vec<NodeId>,
}

/// Fully parsed wait configuration.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub kind: WaitKind,
    pub resume_at: Option<DateTime<Utc>>,
    pub webhook_path: Option<String>,
    pub secret_token: Option<String>,
    pub allowed_ips: Option<Vec<String>>,
    pub response_body: Option<Value>,
    pub correlation_id: Option<String>,
    pub child_run_id: Option<RunId>,
    pub child_workflow_id: Option<String>,
    pub child_input: Option<Value>,
    pub condition: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub on_timeout: TimeoutAction,
    pub default_payload: Option<Value>,
}

impl WaitSpec {
    fn base(kind: WaitKind) -> Self {
        Self {
            kind,
            resume_at: None,
            webhook_path: None,
            secret_token: None,
            allowed_ips: None,
            response_body: None,
            correlation_id: None,
            child_run_id: None,
            child_workflow_id: None,
            child_input: None,
            condition: None,
            poll_interval_ms: None,
            timeout_ms: None,
            on_timeout: TimeoutAction::Error,
            default_payload: None,
        }
    }

    pub fn timer(duration_ms: u64) -> Self {
        Self {
            resume_at: Some(Utc::now() + ChronoDuration::milliseconds(duration_ms as i64)),
            ..Self::base(WaitKind::Timer)
        }
    }

    pub fn datetime(target: DateTime<Utc>) -> Self {
        Self {
            resume_at: Some(target),
            ..Self::base(WaitKind::Datetime)
        }
    }

    pub fn webhook(path: impl Into<String>) -> Self {
        Self {
            webhook_path: Some(path.into()),
            ..Self::base(WaitKind::Webhook)
        }
    }

    pub fn approval() -> Self {
        Self {
            correlation_id: Some(Uuid::new_v4().to_string()),
            ..Self::base(WaitKind::Approval)
        }
    }

    pub fn subworkflow(workflow_id: impl Into<String>, input: Value) -> Self {
        Self {
            child_run_id: Some(Uuid::new_v4().to_string()),
            child_workflow_id: Some(workflow_id.into()),
            child_input: Some(input),
            ..Self::base(WaitKind::Subworkflow)
        }
    }

    pub fn condition(expression: impl Into<String>, poll_interval_ms: u64) -> Self {
        Self {
            resume_at: Some(Utc::now() + ChronoDuration::milliseconds(poll_interval_ms as i64)),
            condition: Some(expression.into()),
            poll_interval_ms: Some(poll_interval_ms),
            ..Self::base(WaitKind::Condition)
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64, on_timeout: TimeoutAction) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.on_timeout = on_timeout;
        self
    }

    /// Parse a `wait` node's config: `type` selects timer/datetime/condition.
    pub fn from_wait_config(config: &Value) -> Result<Self> {
        let kind = config
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("timer");
        let mut spec = match kind {
            "timer" => {
                let duration = config
                    .get("duration")
                    .and_then(|d| d.as_u64())
                    .ok_or_else(|| {
                        EngineError::Validation("timer wait requires a duration".into())
                    })?;
                Self::timer(duration)
            }
            "datetime" => {
                let raw = config.get("until").and_then(|u| u.as_str()).ok_or_else(|| {
                    EngineError::Validation("datetime wait requires 'until'".into())
                })?;
                let target = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        EngineError::Validation(format!("invalid datetime '{raw}': {e}"))
                    })?
                    .with_timezone(&Utc);
                Self::datetime(target)
            }
            "condition" => {
                let expression = config
                    .get("expression")
                    .and_then(|e| e.as_str())
                    .ok_or_else(|| {
                        EngineError::Validation("condition wait requires an expression".into())
                    })?;
                let interval = config
                    .get("pollInterval")
                    .and_then(|p| p.as_u64())
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
                Self::condition(expression, interval)
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "unknown wait type '{other}'"
                )))
            }
        };
        spec.apply_common(config);
        Ok(spec)
    }

    /// Parse a `webhookWait` node's config.
    pub fn from_webhook_config(config: &Value, run_id: &str, node_id: &str) -> Result<Self> {
        let path = config
            .get("path")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string())
            .unwrap_or_else(|| format!("/{run_id}/{node_id}"));
        let mut spec = Self::webhook(path);
        spec.secret_token = config
            .get("secret")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
        spec.allowed_ips = config.get("allowedIps").and_then(|v| {
            v.as_array().map(|ips| {
                ips.iter()
                    .filter_map(|ip| ip.as_str().map(|s| s.to_string()))
                    .collect()
            })
        });
        spec.response_body = config.get("responseBody").cloned();
        spec.apply_common(config);
        Ok(spec)
    }

    fn apply_common(&mut self, config: &Value) {
        if let Some(timeout) = config.get("timeout").and_then(|t| t.as_u64()) {
            self.timeout_ms = Some(timeout);
        }
        if let Some(action) = config
            .get("onTimeout")
            .and_then(|a| serde_json::from_value::<TimeoutAction>(a.clone()).ok())
        {
            self.on_timeout = action;
        }
        if let Some(default) = config.get("defaultPayload") {
            self.default_payload = Some(default.clone());
        }
    }
}

/// What `start_wait` hands back to the caller.
#[derive(Debug, Clone)]
pub struct WaitTicket {
    pub suspension_id: String,
    pub resume_at: Option<DateTime<Utc>>,
    pub webhook_path: Option<String>,
    pub correlation_id: Option<String>,
    pub child_run_id: Option<RunId>,
}

/// A resolved suspension, ready for the engine to rehydrate.
#[derive(Debug, Clone)]
pub struct Resumption {
    pub record: SuspensionRecord,
    pub snapshot: RunState,
    pub payload: Value,
}

/// An incoming request to a webhook wait route.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub method: String,
    pub path: String,
    /// Value of the `x-wait-token` header, if present.
    pub token: Option<String>,
    pub remote_ip: Option<String>,
    pub payload: Value,
}

/// The response body returned to the webhook caller.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub body: Value,
}

/// What the timeout policy decided for an expired suspension.
#[derive(Debug, Clone)]
pub enum TimeoutOutcome {
    /// `on_timeout = error`: the run fails.
    FailRun,
    /// `on_timeout = continue` or `default`: resume with this payload.
    ResumeWith(Value),
}

/// Owns suspension records.
pub struct SuspensionManager {
    store: Arc<dyn StateStore>,
    serializer: Arc<dyn SnapshotSerializer>,
}

impl SuspensionManager {
    pub fn new(store: Arc<dyn StateStore>, serializer: Arc<dyn SnapshotSerializer>) -> Self {
        Self { store, serializer }
    }

    /// Persist a suspension with a detached copy of the state snapshot.
    pub async fn start_wait(
        &self,
        ctx: &WaitContext,
        spec: WaitSpec,
        snapshot: &RunState,
    ) -> Result<WaitTicket> {
        // Round-tripping validates serializability now, not at resume time.
        let stored_state = self.serializer.detach(snapshot)?;

        let timeout_ms = spec.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
        let record = SuspensionRecord {
            id: Uuid::new_v4().to_string(),
            run_id: ctx.run_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            node_id: ctx.node_id.clone(),
            kind: spec.kind,
            resume_at: spec.resume_at,
            webhook_path: spec.webhook_path,
            secret_token: spec.secret_token,
            allowed_ips: spec.allowed_ips,
            response_body: spec.response_body,
            correlation_id: spec.correlation_id,
            child_run_id: spec.child_run_id,
            child_workflow_id: spec.child_workflow_id,
            child_input: spec.child_input,
            condition: spec.condition,
            poll_interval_ms: spec.poll_interval_ms,
            timeout_at: Utc::now() + ChronoDuration::milliseconds(timeout_ms as i64),
            on_timeout: spec.on_timeout,
            default_payload: spec.default_payload,
            stored_state,
            pending_node_ids: ctx.pending_node_ids.clone(),
            status: SuspensionStatus::Pending,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        record
            .validate()
            .map_err(EngineError::Suspension)?;
        self.store.put_suspension(&record).await?;

        tracing::info!(
            run = %ctx.run_id,
            node = %ctx.node_id,
            suspension = %record.id,
            kind = ?record.kind,
            "run suspended"
        );

        Ok(WaitTicket {
            suspension_id: record.id.clone(),
            resume_at: record.resume_at,
            webhook_path: record.webhook_path.clone(),
            correlation_id: record.correlation_id.clone(),
            child_run_id: record.child_run_id.clone(),
        })
    }

    /// Resolve a suspension and return the snapshot for rehydration.
    /// Idempotent: resuming an already-resolved suspension returns the
    /// original resolution without further state transitions.
    pub async fn resume(&self, suspension_id: &str, payload: Value) -> Result<Resumption> {
        match self.store.resolve_suspension(suspension_id, payload).await {
            Ok(record) => {
                let snapshot = record.stored_state.clone();
                let payload = record.resolution.clone().unwrap_or(Value::Null);
                Ok(Resumption {
                    record,
                    snapshot,
                    payload,
                })
            }
            Err(StoreError::SuspensionNotPending { state, .. }) if state == "resolved" => {
                let record = self
                    .store
                    .get_suspension(suspension_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Suspension(format!("suspension '{suspension_id}' not found"))
                    })?;
                let snapshot = record.stored_state.clone();
                let payload = record.resolution.clone().unwrap_or(Value::Null);
                Ok(Resumption {
                    record,
                    snapshot,
                    payload,
                })
            }
            Err(StoreError::SuspensionNotPending { id, state }) => Err(EngineError::Suspension(
                format!("suspension '{id}' is {state} and cannot resume"),
            )),
            Err(other) => Err(other.into()),
        }
    }

    /// Authenticate and resolve a webhook delivery. Failed checks leave the
    /// suspension pending and the run suspended.
    pub async fn handle_webhook(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<(Resumption, WebhookReply)> {
        let record = self
            .store
            .find_suspension_by_webhook_path(&delivery.path)
            .await?
            .ok_or_else(|| {
                EngineError::Suspension(format!("no pending wait at '{}'", delivery.path))
            })?;

        if let Some(expected) = &record.secret_token {
            if delivery.token.as_deref() != Some(expected.as_str()) {
                tracing::warn!(
                    suspension = %record.id,
                    path = %delivery.path,
                    "webhook delivery rejected: bad or missing token"
                );
                return Err(EngineError::Suspension(
                    "webhook token mismatch".to_string(),
                ));
            }
        }
        if let Some(allowed) = &record.allowed_ips {
            if !allowed.is_empty() {
                let ok = delivery
                    .remote_ip
                    .as_deref()
                    .map(|ip| allowed.iter().any(|a| a == ip))
                    .unwrap_or(false);
                if !ok {
                    tracing::warn!(
                        suspension = %record.id,
                        remote_ip = delivery.remote_ip.as_deref().unwrap_or("-"),
                        "webhook delivery rejected: address not allowed"
                    );
                    return Err(EngineError::Suspension(
                        "webhook source address not allowed".to_string(),
                    ));
                }
            }
        }
        if record.timeout_at <= Utc::now() {
            return Err(EngineError::Suspension("webhook wait expired".to_string()));
        }

        let payload = json!({
            "method": delivery.method,
            "body": delivery.payload,
        });
        let resumption = self.resume(&record.id, payload).await?;
        let body = record
            .response_body
            .clone()
            .unwrap_or_else(|| json!({"received": true}));
        Ok((resumption, WebhookReply { body }))
    }

    /// Resolve an approval by correlation id.
    pub async fn resolve_approval(
        &self,
        correlation_id: &str,
        approved: bool,
        payload: Value,
    ) -> Result<Resumption> {
        let record = self
            .store
            .find_suspension_by_correlation(correlation_id)
            .await?
            .ok_or_else(|| {
                EngineError::Suspension(format!(
                    "no pending approval with correlation '{correlation_id}'"
                ))
            })?;
        self.resume(&record.id, json!({"approved": approved, "payload": payload}))
            .await
    }

    /// Resolve the parent suspension when a child run terminates.
    pub async fn complete_subworkflow(
        &self,
        child_run_id: &str,
        status: &str,
        result: Value,
    ) -> Result<Resumption> {
        let record = self
            .store
            .find_suspension_by_child_run(child_run_id)
            .await?
            .ok_or_else(|| {
                EngineError::Suspension(format!("no parent waiting on child run '{child_run_id}'"))
            })?;
        self.resume(&record.id, json!({"status": status, "result": result}))
            .await
    }

    /// Cancel every pending suspension of a run. Returns the cancelled
    /// records so the engine can cascade into child runs.
    pub async fn cancel_for_run(&self, run_id: &str) -> Result<Vec<SuspensionRecord>> {
        let mut cancelled = Vec::new();
        for record in self.store.suspensions_for_run(run_id).await? {
            if record.status == SuspensionStatus::Pending {
                self.store.cancel_suspension(&record.id).await?;
                cancelled.push(record);
            }
        }
        Ok(cancelled)
    }

    /// Apply the timeout policy to an expired suspension.
    pub fn timeout_outcome(record: &SuspensionRecord) -> TimeoutOutcome {
        match record.on_timeout {
            TimeoutAction::Error => TimeoutOutcome::FailRun,
            TimeoutAction::Continue => TimeoutOutcome::ResumeWith(json!({})),
            TimeoutAction::Default => TimeoutOutcome::ResumeWith(
                record.default_payload.clone().unwrap_or_else(|| json!({})),
            ),
        }
    }

    /// Pending suspensions the worker should look at now.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<SuspensionRecord>> {
        Ok(self.store.due_suspensions(now).await?)
    }

    /// Push a condition wait's next evaluation into the future.
    async fn defer_condition(&self, record: &SuspensionRecord) -> Result<()> {
        let interval = record.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let mut updated = record.clone();
        updated.resume_at = Some(Utc::now() + ChronoDuration::milliseconds(interval as i64));
        self.store.put_suspension(&updated).await?;
        Ok(())
    }
}

/// Where the worker delivers resumable suspensions. Implemented by the
/// execution engine.
#[async_trait]
pub trait ResumeTarget: Send + Sync {
    /// Continue a suspended run with the given resolution payload.
    async fn resume_suspended(&self, suspension_id: &str, payload: Value) -> Result<()>;

    /// Fail a suspended run whose wait timed out with `on_timeout = error`.
    async fn fail_suspended(&self, record: &SuspensionRecord, reason: String) -> Result<()>;
}

/// Periodic scanner that fires timer/datetime/condition waits and applies
/// timeout policies. Webhook, approval, and sub-workflow resumptions are
/// event-driven and never pass through here.
pub struct ResumptionWorker {
    manager: Arc<SuspensionManager>,
    target: Arc<dyn ResumeTarget>,
    interval: std::time::Duration,
}

impl ResumptionWorker {
    pub fn new(
        manager: Arc<SuspensionManager>,
        target: Arc<dyn ResumeTarget>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            manager,
            target,
            interval,
        }
    }

    /// One scan pass. Returns how many suspensions were acted on.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.manager.due(now).await?;
        let mut acted = 0;

        for record in due {
            if record.timeout_at <= now {
                acted += 1;
                match SuspensionManager::timeout_outcome(&record) {
                    TimeoutOutcome::FailRun => {
                        self.target
                            .fail_suspended(&record, format!("wait '{}' timed out", record.node_id))
                            .await?;
                    }
                    TimeoutOutcome::ResumeWith(payload) => {
                        self.target.resume_suspended(&record.id, payload).await?;
                    }
                }
                continue;
            }

            match record.kind {
                WaitKind::Timer | WaitKind::Datetime => {
                    acted += 1;
                    self.target
                        .resume_suspended(&record.id, Value::Null)
                        .await?;
                }
                WaitKind::Condition => {
                    let expression = record.condition.clone().unwrap_or_default();
                    let mut warnings = Vec::new();
                    let scope = ResolveScope::new(&record.stored_state);
                    if resolve_bool(&expression, &scope, &mut warnings) {
                        acted += 1;
                        self.target
                            .resume_suspended(&record.id, Value::Null)
                            .await?;
                    } else {
                        self.manager.defer_condition(&record).await?;
                    }
                }
                // Event-driven kinds only show up here on timeout.
                _ => {}
            }
        }
        Ok(acted)
    }

    /// Scan until `shutdown` is notified.
    pub async fn run(self, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "resumption scan failed");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }
}
