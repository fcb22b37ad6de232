//! Pure transform executor: `transform` and `set` nodes.
//!
//! No side effects. Operates on the input items:
//!
//! - `set`: shallow-merge an object of fields over each item.
//! - `pick`: keep only the listed fields of each item.
//! - `rename`: map of old field name to new field name.
//!
//! Operations compose in that order when several are configured. Non-object
//! items pass through `set`/`pick`/`rename` untouched.

use crate::error::Result;
use crate::registry::{ExecutionInput, ExecutionOutput, NodeExecutor};
use crate::resolver::items_of;
use async_trait::async_trait;
use serde_json::Value;

pub struct TransformExecutor;

fn apply(item: &Value, config: &Value) -> Value {
    let Some(obj) = item.as_object() else {
        return item.clone();
    };
    let mut out = obj.clone();

    if let Some(set) = config.get("set").and_then(|s| s.as_object()) {
        for (k, v) in set {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(pick) = config.get("pick").and_then(|p| p.as_array()) {
        let keep: Vec<&str> = pick.iter().filter_map(|k| k.as_str()).collect();
        out.retain(|k, _| keep.contains(&k.as_str()));
    }
    if let Some(rename) = config.get("rename").and_then(|r| r.as_object()) {
        for (from, to) in rename {
            if let (Some(value), Some(to)) = (out.remove(from), to.as_str()) {
                out.insert(to.to_string(), value);
            }
        }
    }
    Value::Object(out)
}

#[async_trait]
impl NodeExecutor for TransformExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput> {
        let was_list = input.inputs.is_array();
        let items: Vec<Value> = items_of(&input.inputs)
            .iter()
            .map(|item| apply(item, &input.node.config))
            .collect();

        let data = if was_list {
            Value::Array(items)
        } else {
            items.into_iter().next().unwrap_or(Value::Null)
        };
        Ok(ExecutionOutput::ok(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::exec_input;
    use serde_json::json;

    #[tokio::test]
    async fn set_merges_fields_over_items() {
        let input = exec_input(
            "t",
            "transform",
            json!({"set": {"tag": "new"}}),
            json!([{"a": 1}, {"a": 2, "tag": "old"}]),
        );
        let out = TransformExecutor.execute(input).await.unwrap();
        assert_eq!(out.data, json!([{"a": 1, "tag": "new"}, {"a": 2, "tag": "new"}]));
    }

    #[tokio::test]
    async fn pick_and_rename_compose() {
        let input = exec_input(
            "t",
            "transform",
            json!({"pick": ["a", "b"], "rename": {"b": "renamed"}}),
            json!({"a": 1, "b": 2, "c": 3}),
        );
        let out = TransformExecutor.execute(input).await.unwrap();
        assert_eq!(out.data, json!({"a": 1, "renamed": 2}));
    }

    #[tokio::test]
    async fn non_object_items_pass_through() {
        let input = exec_input(
            "t",
            "transform",
            json!({"set": {"x": 1}}),
            json!([1, "two"]),
        );
        let out = TransformExecutor.execute(input).await.unwrap();
        assert_eq!(out.data, json!([1, "two"]));
    }
}
