//! Credential reference resolution.
//!
//! Node config never carries secrets. It carries references of the form
//! `{{credential:name}}`, resolved through a [`CredentialResolver`] just
//! before execution. Resolved values are cached per run and the cache is
//! dropped when the run finishes, so secrets never outlive the run that
//! needed them. Resolved values must not appear in logs or surfaced errors.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

const CREDENTIAL_PREFIX: &str = "{{credential:";
const CREDENTIAL_SUFFIX: &str = "}}";

/// Resolve-by-reference vault interface.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Value>;
}

/// Fixed map of credentials, for tests and embedded deployments.
#[derive(Default)]
pub struct StaticCredentialResolver {
    values: HashMap<String, Value>,
}

impl StaticCredentialResolver {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, reference: &str) -> Result<Value> {
        self.values.get(reference).cloned().ok_or_else(|| {
            EngineError::Validation(format!("unknown credential reference '{reference}'"))
        })
    }
}

/// Run-scoped credential cache. One per run; cleared when the run ends.
#[derive(Default)]
pub struct CredentialCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_resolve(
        &self,
        reference: &str,
        resolver: &dyn CredentialResolver,
    ) -> Result<Value> {
        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(reference) {
            return Ok(cached.clone());
        }
        let value = resolver.resolve(reference).await?;
        entries.insert(reference.to_string(), value.clone());
        Ok(value)
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Replace every `{{credential:name}}` string in a config value with the
/// resolved secret. Only exact-match strings are substituted; credentials are
/// never spliced into surrounding text.
pub async fn resolve_credentials(
    config: &Value,
    resolver: &dyn CredentialResolver,
    cache: &CredentialCache,
) -> Result<Value> {
    match config {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(name) = trimmed
                .strip_prefix(CREDENTIAL_PREFIX)
                .and_then(|rest| rest.strip_suffix(CREDENTIAL_SUFFIX))
            {
                return cache.get_or_resolve(name.trim(), resolver).await;
            }
            Ok(config.clone())
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(resolve_credentials(item, resolver, cache)).await?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(
                    k.clone(),
                    Box::pin(resolve_credentials(v, resolver, cache)).await?,
                );
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> StaticCredentialResolver {
        StaticCredentialResolver::new(HashMap::from([(
            "slack-token".to_string(),
            json!("xoxb-secret"),
        )]))
    }

    #[tokio::test]
    async fn exact_references_are_substituted() {
        let cache = CredentialCache::new();
        let config = json!({
            "token": "{{credential:slack-token}}",
            "channel": "#general",
            "nested": {"auth": "{{credential:slack-token}}"}
        });
        let resolved = resolve_credentials(&config, &resolver(), &cache).await.unwrap();
        assert_eq!(resolved["token"], json!("xoxb-secret"));
        assert_eq!(resolved["nested"]["auth"], json!("xoxb-secret"));
        assert_eq!(resolved["channel"], json!("#general"));
        // Second lookup came from the cache.
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn partial_matches_are_left_alone() {
        let cache = CredentialCache::new();
        let config = json!({"text": "prefix {{credential:slack-token}} suffix"});
        let resolved = resolve_credentials(&config, &resolver(), &cache).await.unwrap();
        assert_eq!(
            resolved["text"],
            json!("prefix {{credential:slack-token}} suffix")
        );
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_reference_errors() {
        let cache = CredentialCache::new();
        let config = json!({"token": "{{credential:missing}}"});
        let err = resolve_credentials(&config, &resolver(), &cache).await;
        assert!(matches!(err, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = CredentialCache::new();
        let config = json!("{{credential:slack-token}}");
        resolve_credentials(&config, &resolver(), &cache).await.unwrap();
        assert_eq!(cache.len().await, 1);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
