//! Variable resolution for `{{...}}` references.
//!
//! Node config values are resolved against run state just before execution.
//! The grammar covers state paths (`global.*`, `variables.*`,
//! `trigger.payload.*`, `<nodeId>.output.*`, `<nodeId>.meta.*`), the item
//! scope (`$json`, `$items[i].json.*`, `$node["Name"].json[i].*`,
//! `$input.first()`, `$itemIndex`, `$itemCount`), and the loop scope
//! (`$runIndex`, `$batchIndex`, `$itemIndex`, `$totalItems`, `$batchSize`,
//! `$isLastBatch`, `$loopNodeId`).
//!
//! Two rules shape the output:
//!
//! - **Pure-reference typing**: a string that is exactly one reference and
//!   nothing else resolves to the referenced value's native type. Any other
//!   string stringifies each reference and splices it into the text.
//! - **Forbidden segments**: path segments that name prototype or metaclass
//!   machinery (`__proto__`, `constructor`, `prototype`) never resolve. The
//!   resolver yields null for them and emits a security warning.
//!
//! Resolution failures are not errors here: a missing path resolves to null
//! and a warning is collected for the flight recorder. The engine decides
//! what unresolved input means for the node.

use serde_json::Value;
use std::collections::HashMap;
use wavefront_store::{LoopContext, RunState};

/// Path segments that are rejected wherever they appear.
const FORBIDDEN_SEGMENTS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Current item scope for per-item expressions.
#[derive(Debug, Clone, Copy)]
pub struct ItemScope<'a> {
    pub items: &'a [Value],
    pub index: usize,
}

impl<'a> ItemScope<'a> {
    pub fn current(&self) -> Option<&'a Value> {
        self.items.get(self.index)
    }
}

/// Everything a reference can resolve against.
#[derive(Clone, Copy)]
pub struct ResolveScope<'a> {
    pub state: &'a RunState,
    pub item: Option<ItemScope<'a>>,
    pub loop_ctx: Option<&'a LoopContext>,
}

impl<'a> ResolveScope<'a> {
    pub fn new(state: &'a RunState) -> Self {
        Self {
            state,
            item: None,
            loop_ctx: None,
        }
    }

    pub fn with_item(mut self, item: ItemScope<'a>) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_loop(mut self, ctx: &'a LoopContext) -> Self {
        self.loop_ctx = Some(ctx);
        self
    }
}

/// Warnings accumulated while resolving; surfaced into the execution log.
pub type Warnings = Vec<String>;

/// Resolve every string in a config value, recursing through objects and
/// arrays. Map keys are never treated as templates.
pub fn resolve_config(config: &Value, scope: &ResolveScope<'_>) -> (Value, Warnings) {
    let mut warnings = Vec::new();
    let resolved = resolve_value(config, scope, &mut warnings);
    (resolved, warnings)
}

fn resolve_value(value: &Value, scope: &ResolveScope<'_>, warnings: &mut Warnings) -> Value {
    match value {
        Value::String(s) => resolve_template(s, scope, warnings),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, scope, warnings))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope, warnings));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// One parsed piece of a template string.
enum Part<'a> {
    Static(&'a str),
    Reference(&'a str),
}

fn parse_parts(text: &str) -> Vec<Part<'_>> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(Part::Static(&rest[..open]));
        }
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                parts.push(Part::Reference(after[..close].trim()));
                rest = &after[close + 2..];
            }
            None => {
                // Unterminated opener is literal text.
                parts.push(Part::Static(&rest[open..]));
                rest = "";
                break;
            }
        }
    }
    if !rest.is_empty() {
        parts.push(Part::Static(rest));
    }
    parts
}

/// Resolve a single string. Applies the pure-reference typing rule.
pub fn resolve_template(text: &str, scope: &ResolveScope<'_>, warnings: &mut Warnings) -> Value {
    let parts = parse_parts(text);

    let is_pure = matches!(parts.as_slice(), [Part::Reference(_)]);
    if is_pure {
        if let [Part::Reference(expr)] = parts.as_slice() {
            return resolve_reference(expr, scope, warnings).unwrap_or(Value::Null);
        }
    }

    if !parts.iter().any(|p| matches!(p, Part::Reference(_))) {
        return Value::String(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    for part in parts {
        match part {
            Part::Static(s) => out.push_str(s),
            Part::Reference(expr) => {
                let resolved = resolve_reference(expr, scope, warnings);
                out.push_str(&splice(resolved));
            }
        }
    }
    Value::String(out)
}

/// Stringify a resolved value for splicing into surrounding text.
fn splice(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Reference grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// `.key` or a bracketed quoted key.
    Key(String),
    /// `[3]`
    Index(usize),
    /// `first()`, `last()`, `all()`
    Call(String),
}

/// Tokenize a dotted reference like `$node["My Node"].json[0].field`.
fn parse_segments(expr: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
            }
            b'[' => {
                let close = expr[i..].find(']')? + i;
                let inner = expr[i + 1..close].trim();
                if let Some(stripped) = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                {
                    segments.push(Segment::Key(stripped.to_string()));
                } else {
                    segments.push(Segment::Index(inner.parse().ok()?));
                }
                i = close + 1;
            }
            _ => {
                let end = expr[i..]
                    .find(['.', '['])
                    .map(|off| i + off)
                    .unwrap_or(expr.len());
                let word = expr[i..end].trim();
                if !word.is_empty() {
                    if let Some(name) = word.strip_suffix("()") {
                        segments.push(Segment::Call(name.to_string()));
                    } else {
                        segments.push(Segment::Key(word.to_string()));
                    }
                }
                i = end;
            }
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn forbidden(segments: &[Segment], expr: &str, warnings: &mut Warnings) -> bool {
    for segment in segments {
        if let Segment::Key(key) = segment {
            if FORBIDDEN_SEGMENTS.contains(&key.as_str()) {
                tracing::warn!(
                    security = true,
                    reference = expr,
                    segment = %key,
                    "blocked forbidden path segment in reference"
                );
                warnings.push(format!(
                    "security: reference '{{{{{expr}}}}}' uses forbidden segment '{key}'"
                ));
                return true;
            }
        }
    }
    false
}

/// Resolve one reference expression. `None` means unresolved.
fn resolve_reference(expr: &str, scope: &ResolveScope<'_>, warnings: &mut Warnings) -> Option<Value> {
    let segments = parse_segments(expr)?;
    if forbidden(&segments, expr, warnings) {
        return None;
    }

    let (root, rest) = segments.split_first()?;
    let root_key = match root {
        Segment::Key(k) => k.as_str(),
        _ => return None,
    };

    let resolved = match root_key {
        "global" => walk(serde_json::to_value(&scope.state.global).ok()?, rest),
        "variables" => {
            let vars: Value = scope
                .state
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<serde_json::Map<_, _>>()
                .into();
            walk(vars, rest)
        }
        "trigger" => walk(serde_json::to_value(&scope.state.trigger).ok()?, rest),

        "$json" => {
            let item = item_scope(scope, expr, warnings)?;
            walk(item.current()?.clone(), rest)
        }
        "$items" => {
            let item = item_scope(scope, expr, warnings)?;
            walk(Value::Array(item.items.to_vec()), rest)
        }
        "$itemIndex" => match scope.loop_ctx {
            // Inside a loop the name is shared with the loop scope.
            Some(ctx) if rest.is_empty() => Some(Value::from(ctx.item_index)),
            _ => {
                let item = item_scope(scope, expr, warnings)?;
                Some(Value::from(item.index))
            }
        },
        "$itemCount" => {
            let item = item_scope(scope, expr, warnings)?;
            Some(Value::from(item.items.len()))
        }
        "$input" => {
            let item = item_scope(scope, expr, warnings)?;
            resolve_input_method(&item, rest)
        }
        "$node" => {
            let (name, path) = rest.split_first()?;
            let name = match name {
                Segment::Key(k) => k,
                _ => return None,
            };
            let output = scope.state.node_output(name)?.clone();
            walk(output, path)
        }

        "$runIndex" => loop_var(scope, expr, warnings, |c| Value::from(c.run_index)),
        "$batchIndex" => loop_var(scope, expr, warnings, |c| Value::from(c.batch_index)),
        "$totalItems" => loop_var(scope, expr, warnings, |c| Value::from(c.total_items)),
        "$batchSize" => loop_var(scope, expr, warnings, |c| Value::from(c.batch_size)),
        "$isLastBatch" => loop_var(scope, expr, warnings, |c| Value::from(c.is_last_batch)),
        "$loopNodeId" => loop_var(scope, expr, warnings, |c| {
            Value::from(c.loop_node_id.clone())
        }),

        node_id => {
            let state = scope.state.nodes.get(node_id)?;
            let (field, path) = rest.split_first()?;
            match field {
                Segment::Key(k) if k == "output" => walk(state.output.clone(), path),
                Segment::Key(k) if k == "meta" => {
                    walk(serde_json::to_value(&state.meta).ok()?, path)
                }
                _ => None,
            }
        }
    };

    if resolved.is_none() {
        warnings.push(format!("reference '{{{{{expr}}}}}' did not resolve"));
    }
    resolved
}

fn item_scope<'a>(
    scope: &ResolveScope<'a>,
    expr: &str,
    warnings: &mut Warnings,
) -> Option<ItemScope<'a>> {
    if scope.item.is_none() {
        warnings.push(format!(
            "reference '{{{{{expr}}}}}' requires an item scope, but none is active here"
        ));
    }
    scope.item
}

fn loop_var(
    scope: &ResolveScope<'_>,
    expr: &str,
    warnings: &mut Warnings,
    get: impl Fn(&LoopContext) -> Value,
) -> Option<Value> {
    match scope.loop_ctx {
        Some(ctx) => Some(get(ctx)),
        None => {
            warnings.push(format!(
                "reference '{{{{{expr}}}}}' is only available inside a loop scope"
            ));
            None
        }
    }
}

fn resolve_input_method(item: &ItemScope<'_>, rest: &[Segment]) -> Option<Value> {
    let (method, path) = rest.split_first()?;
    let value = match method {
        Segment::Call(name) if name == "first" => item.items.first()?.clone(),
        Segment::Call(name) if name == "last" => item.items.last()?.clone(),
        Segment::Call(name) if name == "all" => Value::Array(item.items.to_vec()),
        Segment::Key(name) if name == "item" => item.current()?.clone(),
        _ => return None,
    };
    walk(value, path)
}

/// Walk the remaining segments into a value. The key `json` is treated as
/// identity when the value does not actually wrap items under a `json` key,
/// so `$items[0].json.field` works on bare item objects too.
fn walk(mut value: Value, segments: &[Segment]) -> Option<Value> {
    for segment in segments {
        let next = match segment {
            Segment::Key(key) => match &value {
                Value::Object(map) => match map.get(key) {
                    Some(v) => v.clone(),
                    None if key == "json" => continue,
                    None => return None,
                },
                _ if key == "json" => continue,
                _ => return None,
            },
            Segment::Index(ix) => match &value {
                Value::Array(items) => items.get(*ix)?.clone(),
                // Indexing a non-array addresses the value itself at 0.
                _ if *ix == 0 => continue,
                _ => return None,
            },
            Segment::Call(_) => return None,
        };
        value = next;
    }
    Some(value)
}

/// Build the item scope items for a node input value: arrays are item lists,
/// anything else is a single item.
pub fn items_of(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// JSON truthiness: false, null, 0, "" and empty composites are false;
/// everything else is true. The literal strings "true"/"false"/"0" map to
/// their boolean meaning.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let t = s.trim();
            !(t.is_empty() || t.eq_ignore_ascii_case("false") || t == "0")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Convenience for condition expressions: resolve, then coerce to boolean.
pub fn resolve_bool(text: &str, scope: &ResolveScope<'_>, warnings: &mut Warnings) -> bool {
    truthy(&resolve_template(text, scope, warnings))
}

/// Resolved variables map seeded from definitions and trigger overrides.
pub fn seed_variables(
    definitions: &[crate::graph::VariableDefinition],
    overrides: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut variables = HashMap::new();
    for def in definitions {
        if let Some(default) = &def.default_value {
            variables.insert(def.name.clone(), default.clone());
        }
    }
    for (k, v) in overrides {
        variables.insert(k.clone(), v.clone());
    }
    variables
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wavefront_store::{GlobalContext, NodeMeta, NodeState, TriggerInfo};

    fn state_with_node(node_id: &str, output: Value) -> RunState {
        let mut state = RunState::new(
            GlobalContext {
                user_id: "u1".into(),
                workspace_id: "ws1".into(),
                env: "test".into(),
                started_at: chrono::Utc::now(),
                is_test: true,
            },
            TriggerInfo::manual(json!({"x": 1, "name": "ada"})),
        );
        let mut meta = NodeMeta::running();
        meta.settle(wavefront_store::NodeStatus::Completed);
        state
            .nodes
            .insert(node_id.to_string(), NodeState { output, meta });
        state
    }

    #[test]
    fn pure_reference_preserves_native_type() {
        let state = state_with_node("fetch", json!({"count": 3, "tags": ["a", "b"]}));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        let value = resolve_template("{{fetch.output.count}}", &scope, &mut warnings);
        assert_eq!(value, json!(3));

        let value = resolve_template("{{fetch.output.tags}}", &scope, &mut warnings);
        assert_eq!(value, json!(["a", "b"]));
        assert!(warnings.is_empty());
    }

    #[test]
    fn mixed_template_splices_strings() {
        let state = state_with_node("fetch", json!({"count": 3}));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        let value = resolve_template(
            "got {{fetch.output.count}} results for {{trigger.payload.name}}",
            &scope,
            &mut warnings,
        );
        assert_eq!(value, json!("got 3 results for ada"));
    }

    #[test]
    fn trigger_and_global_paths() {
        let state = state_with_node("n", json!(null));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        assert_eq!(
            resolve_template("{{trigger.payload.x}}", &scope, &mut warnings),
            json!(1)
        );
        assert_eq!(
            resolve_template("{{global.userId}}", &scope, &mut warnings),
            json!("u1")
        );
        assert_eq!(
            resolve_template("{{global.isTest}}", &scope, &mut warnings),
            json!(true)
        );
    }

    #[test]
    fn forbidden_segments_resolve_to_null_with_warning() {
        let state = state_with_node("n", json!({"safe": 1}));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        let value = resolve_template("{{n.output.__proto__}}", &scope, &mut warnings);
        assert_eq!(value, Value::Null);
        assert!(warnings.iter().any(|w| w.contains("security")));

        let value = resolve_template("{{n.output.constructor.prototype}}", &scope, &mut warnings);
        assert_eq!(value, Value::Null);

        // Bracketed spellings are caught too.
        let value = resolve_template(r#"{{n.output["__proto__"]}}"#, &scope, &mut warnings);
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn missing_path_resolves_null_with_warning() {
        let state = state_with_node("n", json!({"a": 1}));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        let value = resolve_template("{{n.output.missing.deep}}", &scope, &mut warnings);
        assert_eq!(value, Value::Null);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn item_scope_references() {
        let state = state_with_node("src", json!([{"v": 10}, {"v": 20}]));
        let items = vec![json!({"v": 10}), json!({"v": 20})];
        let scope = ResolveScope::new(&state).with_item(ItemScope {
            items: &items,
            index: 1,
        });
        let mut warnings = Vec::new();

        assert_eq!(
            resolve_template("{{$json.v}}", &scope, &mut warnings),
            json!(20)
        );
        assert_eq!(
            resolve_template("{{$items[0].json.v}}", &scope, &mut warnings),
            json!(10)
        );
        assert_eq!(
            resolve_template("{{$itemIndex}}", &scope, &mut warnings),
            json!(1)
        );
        assert_eq!(
            resolve_template("{{$itemCount}}", &scope, &mut warnings),
            json!(2)
        );
        assert_eq!(
            resolve_template("{{$input.first().v}}", &scope, &mut warnings),
            json!(10)
        );
        assert_eq!(
            resolve_template("{{$input.last().v}}", &scope, &mut warnings),
            json!(20)
        );
        assert_eq!(
            resolve_template("{{$input.item.v}}", &scope, &mut warnings),
            json!(20)
        );
        assert_eq!(
            resolve_template(r#"{{$node["src"].json[1].v}}"#, &scope, &mut warnings),
            json!(20)
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn item_references_without_scope_warn() {
        let state = state_with_node("n", json!(null));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        assert_eq!(
            resolve_template("{{$json.field}}", &scope, &mut warnings),
            Value::Null
        );
        assert!(warnings.iter().any(|w| w.contains("item scope")));
    }

    #[test]
    fn loop_scope_references() {
        let state = state_with_node("n", json!(null));
        let ctx = LoopContext {
            run_index: 2,
            batch_index: 2,
            item_index: 6,
            batch_size: 3,
            total_items: 10,
            is_last_batch: false,
            loop_node_id: "l".into(),
        };
        let scope = ResolveScope::new(&state).with_loop(&ctx);
        let mut warnings = Vec::new();

        assert_eq!(
            resolve_template("{{$runIndex}}", &scope, &mut warnings),
            json!(2)
        );
        assert_eq!(
            resolve_template("{{$isLastBatch}}", &scope, &mut warnings),
            json!(false)
        );
        assert_eq!(
            resolve_template("{{$loopNodeId}}", &scope, &mut warnings),
            json!("l")
        );
        assert_eq!(
            resolve_template("{{$itemIndex}}", &scope, &mut warnings),
            json!(6)
        );

        // Outside a loop the variables warn and resolve null.
        let bare = ResolveScope::new(&state);
        assert_eq!(
            resolve_template("{{$runIndex}}", &bare, &mut warnings),
            Value::Null
        );
        assert!(warnings.iter().any(|w| w.contains("loop scope")));
    }

    #[test]
    fn resolve_config_recurses() {
        let state = state_with_node("fetch", json!({"url": "https://x", "n": 2}));
        let scope = ResolveScope::new(&state);

        let config = json!({
            "endpoint": "{{fetch.output.url}}",
            "nested": {"count": "{{fetch.output.n}}"},
            "list": ["{{fetch.output.n}}", "literal"],
            "number": 7
        });
        let (resolved, warnings) = resolve_config(&config, &scope);
        assert_eq!(resolved["endpoint"], json!("https://x"));
        assert_eq!(resolved["nested"]["count"], json!(2));
        assert_eq!(resolved["list"], json!([2, "literal"]));
        assert_eq!(resolved["number"], json!(7));
        assert!(warnings.is_empty());
    }

    #[test]
    fn resolve_bool_truthiness() {
        let state = state_with_node("c", json!({"flag": true, "n": 0}));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        assert!(resolve_bool("{{c.output.flag}}", &scope, &mut warnings));
        assert!(!resolve_bool("{{c.output.n}}", &scope, &mut warnings));
        assert!(!resolve_bool("{{c.output.missing}}", &scope, &mut warnings));
        assert!(resolve_bool("true", &scope, &mut warnings));
        assert!(!resolve_bool("false", &scope, &mut warnings));
        assert!(!resolve_bool("", &scope, &mut warnings));
    }

    #[test]
    fn unterminated_braces_are_literal() {
        let state = state_with_node("n", json!(null));
        let scope = ResolveScope::new(&state);
        let mut warnings = Vec::new();

        assert_eq!(
            resolve_template("hello {{oops", &scope, &mut warnings),
            json!("hello {{oops")
        );
    }
}
