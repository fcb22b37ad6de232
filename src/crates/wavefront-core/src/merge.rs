//! Merge coordination: multi-branch synchronization with exactly-once
//! completion.
//!
//! Each branch reaching a merge node records an arrival. Arrivals for the
//! same (run, merge node) pair are serialized through a per-key async lock,
//! so the completion predicate fires exactly once no matter how branches
//! interleave. Once complete, the merged output is persisted on the record
//! and later arrivals observe the completed result instead of re-merging.
//!
//! The merged output is always a freshly allocated structure: downstream
//! mutation can never reach back into a sibling branch's items.

use crate::error::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use wavefront_store::{
    BranchArrival, ConflictPolicy, DataMode, MergeRecord, MergeStrategy, StateStore,
};

/// Merge behavior parsed from a merge node's config.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    pub wait_n: Option<usize>,
    pub data_mode: DataMode,
    pub conflict_policy: ConflictPolicy,
    pub key_field: Option<String>,
    /// Milliseconds before the merge gives up waiting and emits whatever
    /// arrived.
    pub timeout: Option<u64>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::WaitAll,
            wait_n: None,
            data_mode: DataMode::Append,
            conflict_policy: ConflictPolicy::default(),
            key_field: None,
            timeout: None,
        }
    }
}

impl MergeConfig {
    pub fn from_node_config(config: &Value) -> Self {
        serde_json::from_value(config.clone()).unwrap_or_default()
    }
}

/// Result of recording one branch arrival.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The predicate is satisfied; `items` is the merged output.
    Complete { items: Vec<Value> },
    /// Still waiting for more branches.
    Pending { arrived: usize, required: usize },
}

/// Owns merge records and their per-key critical sections.
pub struct MergeCoordinator {
    store: Arc<dyn StateStore>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, run_id: &str, merge_node_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((run_id.to_string(), merge_node_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record a branch completion and test the completion predicate.
    pub async fn record_arrival(
        &self,
        run_id: &str,
        merge_node_id: &str,
        expected_branches: usize,
        config: &MergeConfig,
        branch_id: &str,
        arrival: BranchArrival,
    ) -> Result<MergeOutcome> {
        let lock = self.key_lock(run_id, merge_node_id).await;
        let _guard = lock.lock().await;

        let mut record = match self.store.get_merge_record(run_id, merge_node_id).await? {
            Some(record) => record,
            None => MergeRecord {
                run_id: run_id.to_string(),
                merge_node_id: merge_node_id.to_string(),
                strategy: config.strategy,
                wait_n: config.wait_n,
                data_mode: config.data_mode,
                conflict_policy: config.conflict_policy,
                key_field: config.key_field.clone(),
                expected_branches,
                branch_data: HashMap::new(),
                branch_order: Vec::new(),
                completed: false,
                merged_output: None,
                timeout_at: config
                    .timeout
                    .map(|ms| chrono::Utc::now() + chrono::Duration::milliseconds(ms as i64)),
            },
        };

        if record.completed {
            // Late arrival after completion observes the settled output.
            let items = record.merged_output.clone().unwrap_or_default();
            return Ok(MergeOutcome::Complete { items });
        }

        if !record.branch_data.contains_key(branch_id) {
            record.branch_order.push(branch_id.to_string());
            record.branch_data.insert(branch_id.to_string(), arrival);
        }

        if record.predicate_met() {
            let items = combine(&record);
            record.completed = true;
            record.merged_output = Some(items.clone());
            self.store.put_merge_record(&record).await?;
            tracing::debug!(
                run = run_id,
                node = merge_node_id,
                branches = record.branch_data.len(),
                "merge completed"
            );
            Ok(MergeOutcome::Complete { items })
        } else {
            let arrived = record.branch_data.len();
            let required = record.required();
            self.store.put_merge_record(&record).await?;
            Ok(MergeOutcome::Pending { arrived, required })
        }
    }

    /// Force-complete a merge with whatever branches have arrived. Used when
    /// the merge's own timeout elapses.
    pub async fn flush(&self, run_id: &str, merge_node_id: &str) -> Result<Vec<Value>> {
        let lock = self.key_lock(run_id, merge_node_id).await;
        let _guard = lock.lock().await;

        let mut record = match self.store.get_merge_record(run_id, merge_node_id).await? {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };
        if record.completed {
            return Ok(record.merged_output.unwrap_or_default());
        }
        let items = combine(&record);
        record.completed = true;
        record.merged_output = Some(items.clone());
        self.store.put_merge_record(&record).await?;
        Ok(items)
    }

    /// Cancel a merge outright: completes the record with empty output.
    pub async fn cancel(&self, run_id: &str, merge_node_id: &str) -> Result<()> {
        let lock = self.key_lock(run_id, merge_node_id).await;
        let _guard = lock.lock().await;

        if let Some(mut record) = self.store.get_merge_record(run_id, merge_node_id).await? {
            if !record.completed {
                record.completed = true;
                record.merged_output = Some(Vec::new());
                self.store.put_merge_record(&record).await?;
            }
        }
        Ok(())
    }
}

/// Combine branch outputs into the merged item list per the record's data
/// mode. Output is always freshly allocated.
fn combine(record: &MergeRecord) -> Vec<Value> {
    let ordered: Vec<&BranchArrival> = record
        .branch_order
        .iter()
        .filter_map(|id| record.branch_data.get(id))
        .collect();

    match record.data_mode {
        DataMode::Append => ordered
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect(),

        DataMode::PassThrough => ordered
            .first()
            .map(|b| b.items.clone())
            .unwrap_or_default(),

        DataMode::Join => {
            let longest = ordered.iter().map(|b| b.items.len()).max().unwrap_or(0);
            (0..longest)
                .map(|i| {
                    let mut joined = serde_json::Map::new();
                    for branch in &ordered {
                        let Some(item) = branch.items.get(i) else {
                            continue;
                        };
                        match item {
                            Value::Object(map) => {
                                for (k, v) in map {
                                    joined.insert(k.clone(), v.clone());
                                }
                            }
                            // Non-object elements are keyed by their source node.
                            other => {
                                joined.insert(branch.node_id.clone(), other.clone());
                            }
                        }
                    }
                    Value::Object(joined)
                })
                .collect()
        }

        DataMode::DeepMerge => {
            let mut merged = Value::Object(serde_json::Map::new());
            for branch in &ordered {
                for item in &branch.items {
                    let incoming = match item {
                        Value::Object(_) => item.clone(),
                        other => {
                            let mut wrapper = serde_json::Map::new();
                            wrapper.insert(branch.node_id.clone(), other.clone());
                            Value::Object(wrapper)
                        }
                    };
                    merged = deep_merge(merged, incoming, record.conflict_policy);
                }
            }
            vec![merged]
        }

        DataMode::KeyedMerge => {
            let key_field = record.key_field.as_deref().unwrap_or("id");
            let mut order: Vec<String> = Vec::new();
            let mut grouped: HashMap<String, serde_json::Map<String, Value>> = HashMap::new();
            for branch in &ordered {
                for item in &branch.items {
                    let Some(obj) = item.as_object() else {
                        continue;
                    };
                    let key = match obj.get(key_field) {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => continue,
                    };
                    let entry = grouped.entry(key.clone()).or_insert_with(|| {
                        order.push(key.clone());
                        serde_json::Map::new()
                    });
                    // Duplicates shallow-merge in arrival order.
                    for (k, v) in obj {
                        entry.insert(k.clone(), v.clone());
                    }
                }
            }
            order
                .into_iter()
                .filter_map(|key| grouped.remove(&key).map(Value::Object))
                .collect()
        }
    }
}

/// Recursive object merge with a conflict policy for primitive collisions.
fn deep_merge(base: Value, incoming: Value, policy: ConflictPolicy) -> Value {
    match (base, incoming) {
        (Value::Object(mut base_map), Value::Object(incoming_map)) => {
            for (key, incoming_value) in incoming_map {
                match base_map.remove(&key) {
                    Some(existing) => {
                        base_map.insert(key, deep_merge(existing, incoming_value, policy));
                    }
                    None => {
                        base_map.insert(key, incoming_value);
                    }
                }
            }
            Value::Object(base_map)
        }
        (base, incoming) => match policy {
            ConflictPolicy::First => base,
            ConflictPolicy::Last => incoming,
            ConflictPolicy::Merge => match base {
                Value::Array(mut items) => {
                    items.push(incoming);
                    Value::Array(items)
                }
                base => Value::Array(vec![base, incoming]),
            },
        },
    }
}
