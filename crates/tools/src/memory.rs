//! In-memory key-value back end — useful for demos and ephemeral runs.

use crate::params::{optional_str, required_str};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use taskpilot_core::{Backend, BackendFailure, FailureReason, OperationSpec, Parameters};
use tokio::sync::RwLock;

pub const NAME: &str = "memory";

/// A key-value store kept in process memory.
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec::new(NAME, "get")
                .describe("Read the value stored under `key`.")
                .read_only(),
            OperationSpec::new(NAME, "list")
                .describe("List stored keys, optionally filtered by `prefix`.")
                .read_only(),
            OperationSpec::new(NAME, "set").describe("Store `value` under `key`."),
            OperationSpec::new(NAME, "delete").describe("Remove `key` if present."),
        ]
    }

    async fn invoke(&self, operation: &str, parameters: &Parameters) -> Result<Value, BackendFailure> {
        match operation {
            "get" => {
                let key = required_str(parameters, "key")?;
                let entries = self.entries.read().await;
                entries
                    .get(key)
                    .map(|value| json!({ "key": key, "value": value }))
                    .ok_or_else(|| {
                        BackendFailure::new(FailureReason::NotFound, format!("no entry for '{key}'"))
                    })
            }
            "list" => {
                let prefix = optional_str(parameters, "prefix")?.unwrap_or("");
                let entries = self.entries.read().await;
                let keys: Vec<&String> = entries.keys().filter(|k| k.starts_with(prefix)).collect();
                Ok(json!({ "keys": keys }))
            }
            "set" => {
                let key = required_str(parameters, "key")?;
                let value = parameters
                    .get("value")
                    .cloned()
                    .ok_or_else(|| BackendFailure::invalid_parameters("missing 'value'"))?;
                let previous = self.entries.write().await.insert(key.to_string(), value);
                Ok(json!({ "key": key, "replaced": previous.is_some() }))
            }
            "delete" => {
                let key = required_str(parameters, "key")?;
                let removed = self.entries.write().await.remove(key).is_some();
                Ok(json!({ "key": key, "removed": removed }))
            }
            other => Err(BackendFailure::unknown_operation(NAME, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn set_then_get() {
        let backend = MemoryBackend::new();
        let result = backend
            .invoke("set", &params(&[("key", json!("a")), ("value", json!(42))]))
            .await
            .unwrap();
        assert_eq!(result["replaced"], json!(false));

        let result = backend
            .invoke("get", &params(&[("key", json!("a"))]))
            .await
            .unwrap();
        assert_eq!(result["value"], json!(42));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend
            .invoke("get", &params(&[("key", json!("nope"))]))
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::NotFound);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let backend = MemoryBackend::new();
        for key in ["user:1", "user:2", "job:1"] {
            backend
                .invoke("set", &params(&[("key", json!(key)), ("value", json!(true))]))
                .await
                .unwrap();
        }
        let result = backend
            .invoke("list", &params(&[("prefix", json!("user:"))]))
            .await
            .unwrap();
        assert_eq!(result["keys"], json!(["user:1", "user:2"]));
        assert_eq!(backend.len().await, 3);
    }

    #[tokio::test]
    async fn delete_reports_whether_removed() {
        let backend = MemoryBackend::new();
        backend
            .invoke("set", &params(&[("key", json!("a")), ("value", json!(1))]))
            .await
            .unwrap();
        let first = backend
            .invoke("delete", &params(&[("key", json!("a"))]))
            .await
            .unwrap();
        let second = backend
            .invoke("delete", &params(&[("key", json!("a"))]))
            .await
            .unwrap();
        assert_eq!(first["removed"], json!(true));
        assert_eq!(second["removed"], json!(false));
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn bad_parameters_are_rejected() {
        let backend = MemoryBackend::new();
        let err = backend.invoke("get", &Parameters::new()).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::InvalidParameters);

        let err = backend
            .invoke("set", &params(&[("key", json!("a"))]))
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::InvalidParameters);

        let err = backend.invoke("flush", &Parameters::new()).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::UnknownOperation);
    }

    #[test]
    fn reads_are_side_effect_free() {
        let ops = MemoryBackend::new().operations();
        let free: Vec<&str> = ops
            .iter()
            .filter(|op| op.side_effect_free)
            .map(|op| op.name.as_str())
            .collect();
        assert_eq!(free, vec!["get", "list"]);
    }
}
