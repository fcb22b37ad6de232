//! Flight recorder: the per-run execution log.
//!
//! Every run carries a structured log persisted alongside its state. The
//! recorder writes each entry twice: once into the run's durable log through
//! the state store, and once as a `tracing` event for live observability.
//! The workflow's `logging` setting filters what gets persisted: `minimal`
//! keeps warnings and errors, `standard` adds lifecycle entries, `debug`
//! keeps everything.

use crate::graph::LoggingMode;
use std::sync::Arc;
use wavefront_store::{ExecutionLogEntry, LogLevel, StateStore};

/// Records structured events for one run.
pub struct FlightRecorder {
    run_id: String,
    mode: LoggingMode,
    store: Arc<dyn StateStore>,
}

impl FlightRecorder {
    pub fn new(run_id: impl Into<String>, mode: LoggingMode, store: Arc<dyn StateStore>) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            store,
        }
    }

    fn persists(&self, level: LogLevel) -> bool {
        match self.mode {
            LoggingMode::Minimal => level >= LogLevel::Warn,
            LoggingMode::Standard => level >= LogLevel::Info,
            LoggingMode::Debug => true,
        }
    }

    /// Record one event. Persistence failures are traced, never fatal: a
    /// logging problem must not take the run down.
    pub async fn record(
        &self,
        level: LogLevel,
        node_id: Option<&str>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Debug => {
                tracing::debug!(run = %self.run_id, node = node_id.unwrap_or("-"), "{message}")
            }
            LogLevel::Info => {
                tracing::info!(run = %self.run_id, node = node_id.unwrap_or("-"), "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(run = %self.run_id, node = node_id.unwrap_or("-"), "{message}")
            }
            LogLevel::Error => {
                tracing::error!(run = %self.run_id, node = node_id.unwrap_or("-"), "{message}")
            }
        }

        if !self.persists(level) {
            return;
        }
        let mut entry = ExecutionLogEntry::new(level, node_id.map(|s| s.to_string()), message);
        if let Some(data) = data {
            entry = entry.with_data(data);
        }
        if let Err(err) = self.store.append_log(&self.run_id, entry).await {
            tracing::warn!(run = %self.run_id, error = %err, "failed to persist log entry");
        }
    }

    pub async fn debug(&self, node_id: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Debug, node_id, message, None).await;
    }

    pub async fn info(&self, node_id: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Info, node_id, message, None).await;
    }

    pub async fn warn(&self, node_id: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Warn, node_id, message, None).await;
    }

    pub async fn error(&self, node_id: Option<&str>, message: impl Into<String>) {
        self.record(LogLevel::Error, node_id, message, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavefront_store::{
        GlobalContext, InMemoryStateStore, Run, RunState, StateStore, TriggerInfo,
    };

    async fn store_with_run(run_id: &str) -> Arc<InMemoryStateStore> {
        let store = Arc::new(InMemoryStateStore::new());
        let state = RunState::new(
            GlobalContext::default(),
            TriggerInfo::manual(serde_json::json!({})),
        );
        store
            .put_run(&Run::new(run_id.to_string(), "wf", state))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn standard_mode_drops_debug() {
        let store = store_with_run("r1").await;
        let recorder = FlightRecorder::new("r1", LoggingMode::Standard, store.clone());

        recorder.debug(Some("a"), "noise").await;
        recorder.info(Some("a"), "lifecycle").await;
        recorder.error(None, "boom").await;

        let run = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.logs.len(), 2);
        assert_eq!(run.logs[0].message, "lifecycle");
        assert_eq!(run.logs[1].message, "boom");
    }

    #[tokio::test]
    async fn minimal_mode_keeps_only_problems() {
        let store = store_with_run("r1").await;
        let recorder = FlightRecorder::new("r1", LoggingMode::Minimal, store.clone());

        recorder.info(None, "lifecycle").await;
        recorder.warn(None, "odd").await;

        let run = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.logs.len(), 1);
        assert_eq!(run.logs[0].message, "odd");
    }

    #[tokio::test]
    async fn debug_mode_keeps_everything() {
        let store = store_with_run("r1").await;
        let recorder = FlightRecorder::new("r1", LoggingMode::Debug, store.clone());

        recorder.debug(None, "a").await;
        recorder.info(None, "b").await;

        let run = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.logs.len(), 2);
    }
}
