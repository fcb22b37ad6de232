//! In-memory [`StateStore`] backend.
//!
//! The reference implementation: every record lives in a `RwLock`-guarded
//! map. Suitable for tests, examples, and single-process deployments where
//! durability across restarts is not required. Production backends implement
//! the same trait over a relational store.
//!
//! The store also exposes a few counters (`run_count`, `suspension_count`)
//! and a `clear()` used by tests.

use crate::error::{Result, StoreError};
use crate::records::{
    ErrorWorkflowConfig, LoopRecord, MergeRecord, PinnedData, SuspensionRecord, SuspensionStatus,
};
use crate::state::{ExecutionLogEntry, NodeState, Run, RunStatus};
use crate::traits::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStateStore {
    runs: RwLock<HashMap<String, Run>>,
    suspensions: RwLock<HashMap<String, SuspensionRecord>>,
    merges: RwLock<HashMap<(String, String), MergeRecord>>,
    loops: RwLock<HashMap<(String, String), LoopRecord>>,
    pins: RwLock<HashMap<(String, String, String), PinnedData>>,
    error_configs: RwLock<HashMap<String, Vec<ErrorWorkflowConfig>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored.
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Number of suspension records currently stored, any status.
    pub async fn suspension_count(&self) -> usize {
        self.suspensions.read().await.len()
    }

    /// Drop everything. Test helper.
    pub async fn clear(&self) {
        self.runs.write().await.clear();
        self.suspensions.write().await.clear();
        self.merges.write().await.clear();
        self.loops.write().await.clear();
        self.pins.write().await.clear();
        self.error_configs.write().await.clear();
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_run(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.get(&run.id) {
            None => return Err(StoreError::RunNotFound(run.id.clone())),
            Some(existing) if existing.status.is_terminal() => {
                return Err(StoreError::RunFinalized(run.id.clone()));
            }
            Some(_) => {}
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunFinalized(run_id.to_string()));
        }
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_runs_for_workflow(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let mut matched: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matched)
    }

    async fn put_node_state(&self, run_id: &str, node_id: &str, state: &NodeState) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunFinalized(run_id.to_string()));
        }
        run.state.nodes.insert(node_id.to_string(), state.clone());
        Ok(())
    }

    async fn delete_node_state(&self, run_id: &str, node_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunFinalized(run_id.to_string()));
        }
        run.state.nodes.remove(node_id);
        Ok(())
    }

    async fn put_suspension(&self, record: &SuspensionRecord) -> Result<()> {
        self.suspensions
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_suspension(&self, id: &str) -> Result<Option<SuspensionRecord>> {
        Ok(self.suspensions.read().await.get(id).cloned())
    }

    async fn find_suspension_by_webhook_path(
        &self,
        path: &str,
    ) -> Result<Option<SuspensionRecord>> {
        Ok(self
            .suspensions
            .read()
            .await
            .values()
            .find(|s| {
                s.status == SuspensionStatus::Pending && s.webhook_path.as_deref() == Some(path)
            })
            .cloned())
    }

    async fn find_suspension_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<SuspensionRecord>> {
        Ok(self
            .suspensions
            .read()
            .await
            .values()
            .find(|s| {
                s.status == SuspensionStatus::Pending
                    && s.correlation_id.as_deref() == Some(correlation_id)
            })
            .cloned())
    }

    async fn find_suspension_by_child_run(
        &self,
        child_run_id: &str,
    ) -> Result<Option<SuspensionRecord>> {
        Ok(self
            .suspensions
            .read()
            .await
            .values()
            .find(|s| {
                s.status == SuspensionStatus::Pending
                    && s.child_run_id.as_deref() == Some(child_run_id)
            })
            .cloned())
    }

    async fn resolve_suspension(
        &self,
        id: &str,
        resolution: serde_json::Value,
    ) -> Result<SuspensionRecord> {
        let mut suspensions = self.suspensions.write().await;
        let record = suspensions
            .get_mut(id)
            .ok_or_else(|| StoreError::SuspensionNotFound(id.to_string()))?;
        match record.status {
            SuspensionStatus::Pending => {
                record.status = SuspensionStatus::Resolved;
                record.resolution = Some(resolution);
                record.resolved_at = Some(Utc::now());
                Ok(record.clone())
            }
            SuspensionStatus::Resolved => Err(StoreError::SuspensionNotPending {
                id: id.to_string(),
                state: "resolved".to_string(),
            }),
            SuspensionStatus::Cancelled => Err(StoreError::SuspensionNotPending {
                id: id.to_string(),
                state: "cancelled".to_string(),
            }),
        }
    }

    async fn cancel_suspension(&self, id: &str) -> Result<()> {
        let mut suspensions = self.suspensions.write().await;
        let record = suspensions
            .get_mut(id)
            .ok_or_else(|| StoreError::SuspensionNotFound(id.to_string()))?;
        if record.status == SuspensionStatus::Pending {
            record.status = SuspensionStatus::Cancelled;
            record.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn due_suspensions(&self, now: DateTime<Utc>) -> Result<Vec<SuspensionRecord>> {
        Ok(self
            .suspensions
            .read()
            .await
            .values()
            .filter(|s| s.status == SuspensionStatus::Pending)
            .filter(|s| {
                let fire = s.is_poll_driven() && s.resume_at.map(|t| t <= now).unwrap_or(false);
                let timed_out = s.timeout_at <= now;
                fire || timed_out
            })
            .cloned()
            .collect())
    }

    async fn suspensions_for_run(&self, run_id: &str) -> Result<Vec<SuspensionRecord>> {
        Ok(self
            .suspensions
            .read()
            .await
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn put_merge_record(&self, record: &MergeRecord) -> Result<()> {
        self.merges.write().await.insert(
            (record.run_id.clone(), record.merge_node_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_merge_record(
        &self,
        run_id: &str,
        merge_node_id: &str,
    ) -> Result<Option<MergeRecord>> {
        Ok(self
            .merges
            .read()
            .await
            .get(&(run_id.to_string(), merge_node_id.to_string()))
            .cloned())
    }

    async fn put_loop_record(&self, record: &LoopRecord) -> Result<()> {
        self.loops.write().await.insert(
            (record.run_id.clone(), record.loop_node_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn get_loop_record(
        &self,
        run_id: &str,
        loop_node_id: &str,
    ) -> Result<Option<LoopRecord>> {
        Ok(self
            .loops
            .read()
            .await
            .get(&(run_id.to_string(), loop_node_id.to_string()))
            .cloned())
    }

    async fn put_pin(&self, pin: &PinnedData) -> Result<()> {
        self.pins.write().await.insert(
            (
                pin.workflow_id.clone(),
                pin.node_id.clone(),
                pin.user_id.clone(),
            ),
            pin.clone(),
        );
        Ok(())
    }

    async fn find_pin(
        &self,
        workflow_id: &str,
        node_id: &str,
        user_id: &str,
    ) -> Result<Option<PinnedData>> {
        Ok(self
            .pins
            .read()
            .await
            .get(&(
                workflow_id.to_string(),
                node_id.to_string(),
                user_id.to_string(),
            ))
            .cloned())
    }

    async fn record_pin_use(&self, workflow_id: &str, node_id: &str, user_id: &str) -> Result<()> {
        if let Some(pin) = self.pins.write().await.get_mut(&(
            workflow_id.to_string(),
            node_id.to_string(),
            user_id.to_string(),
        )) {
            pin.usage_count += 1;
        }
        Ok(())
    }

    async fn put_error_workflow_config(&self, config: &ErrorWorkflowConfig) -> Result<()> {
        self.error_configs
            .write()
            .await
            .entry(config.workflow_id.clone())
            .or_default()
            .push(config.clone());
        Ok(())
    }

    async fn error_workflows_for(&self, workflow_id: &str) -> Result<Vec<ErrorWorkflowConfig>> {
        Ok(self
            .error_configs
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, run_id: &str, entry: ExecutionLogEntry) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunFinalized(run_id.to_string()));
        }
        run.logs.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{TimeoutAction, WaitKind};
    use crate::state::{GlobalContext, LogLevel, NodeMeta, RunState, TriggerInfo};
    use chrono::Duration;
    use serde_json::json;

    fn sample_run(id: &str) -> Run {
        let state = RunState::new(GlobalContext::default(), TriggerInfo::manual(json!({})));
        Run::new(id.to_string(), "wf-1", state)
    }

    fn sample_suspension(id: &str, resume_in: i64) -> SuspensionRecord {
        let now = Utc::now();
        SuspensionRecord {
            id: id.to_string(),
            run_id: "r1".into(),
            workflow_id: "wf-1".into(),
            node_id: "wait".into(),
            kind: WaitKind::Timer,
            resume_at: Some(now + Duration::milliseconds(resume_in)),
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
            timeout_at: now + Duration::hours(1),
            on_timeout: TimeoutAction::Error,
            default_payload: None,
            stored_state: RunState::new(GlobalContext::default(), TriggerInfo::manual(json!({}))),
            pending_node_ids: vec![],
            status: SuspensionStatus::Pending,
            resolution: None,
            created_at: now,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn run_round_trip() {
        let store = InMemoryStateStore::new();
        let run = sample_run("r1");
        store.put_run(&run).await.unwrap();
        assert_eq!(store.run_count().await, 1);

        let loaded = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf-1");
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_runs_reject_mutation() {
        let store = InMemoryStateStore::new();
        let run = sample_run("r1");
        store.put_run(&run).await.unwrap();
        store
            .update_run_status("r1", RunStatus::Completed)
            .await
            .unwrap();

        let node_state = NodeState {
            output: json!({}),
            meta: NodeMeta::running(),
        };
        let err = store.put_node_state("r1", "a", &node_state).await;
        assert!(matches!(err, Err(StoreError::RunFinalized(_))));

        let err = store
            .append_log("r1", ExecutionLogEntry::new(LogLevel::Info, None, "late"))
            .await;
        assert!(matches!(err, Err(StoreError::RunFinalized(_))));

        let err = store.update_run_status("r1", RunStatus::Running).await;
        assert!(matches!(err, Err(StoreError::RunFinalized(_))));
    }

    #[tokio::test]
    async fn resolve_suspension_is_single_shot() {
        let store = InMemoryStateStore::new();
        store
            .put_suspension(&sample_suspension("s1", 0))
            .await
            .unwrap();

        let resolved = store
            .resolve_suspension("s1", json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(resolved.status, SuspensionStatus::Resolved);
        assert_eq!(resolved.resolution, Some(json!({"ok": true})));

        // Second resolution attempt is rejected at the store level.
        let err = store.resolve_suspension("s1", json!({"again": true})).await;
        assert!(matches!(
            err,
            Err(StoreError::SuspensionNotPending { ref state, .. }) if state == "resolved"
        ));
    }

    #[tokio::test]
    async fn due_suspensions_scans_by_resume_at() {
        let store = InMemoryStateStore::new();
        store
            .put_suspension(&sample_suspension("past", -1000))
            .await
            .unwrap();
        store
            .put_suspension(&sample_suspension("future", 60_000))
            .await
            .unwrap();

        let due = store.due_suspensions(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "past");
    }

    #[tokio::test]
    async fn webhook_lookup_ignores_resolved() {
        let store = InMemoryStateStore::new();
        let mut rec = sample_suspension("s1", 0);
        rec.kind = WaitKind::Webhook;
        rec.resume_at = None;
        rec.webhook_path = Some("/cb".into());
        store.put_suspension(&rec).await.unwrap();

        assert!(store
            .find_suspension_by_webhook_path("/cb")
            .await
            .unwrap()
            .is_some());

        store.resolve_suspension("s1", json!({})).await.unwrap();
        assert!(store
            .find_suspension_by_webhook_path("/cb")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pin_usage_counter_increments() {
        let store = InMemoryStateStore::new();
        let pin = PinnedData {
            id: "p1".into(),
            workflow_id: "wf-1".into(),
            node_id: "a".into(),
            user_id: "u1".into(),
            mode: crate::records::PinMode::Always,
            output: json!({"pinned": true}),
            label: None,
            created_at: Utc::now(),
            usage_count: 0,
        };
        store.put_pin(&pin).await.unwrap();
        store.record_pin_use("wf-1", "a", "u1").await.unwrap();
        store.record_pin_use("wf-1", "a", "u1").await.unwrap();

        let loaded = store.find_pin("wf-1", "a", "u1").await.unwrap().unwrap();
        assert_eq!(loaded.usage_count, 2);
    }
}
