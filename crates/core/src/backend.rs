//! Back-end trait — the abstraction over external tool services.
//!
//! A back end (file access, browser automation, shell, key-value memory)
//! exposes a catalogue of named operations. The executor looks back ends
//! up by name in the [`BackendRegistry`] and invokes operations on them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Parameters passed to a back-end operation.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// One entry in a back end's operation catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Owning back end
    pub backend: String,

    /// Operation name (e.g., "read_file")
    pub name: String,

    /// Description shown to the tool planner
    #[serde(default)]
    pub description: String,

    /// Safe to retry after a failure
    #[serde(default)]
    pub side_effect_free: bool,
}

impl OperationSpec {
    pub fn new(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            name: name.into(),
            description: String::new(),
            side_effect_free: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the operation as read-only.
    pub fn read_only(mut self) -> Self {
        self.side_effect_free = true;
        self
    }
}

/// Machine-readable reason attached to a back-end failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownBackend,
    UnknownOperation,
    InvalidParameters,
    NotFound,
    PermissionDenied,
    Unavailable,
    Timeout,
    ExecutionFailed,
}

impl FailureReason {
    /// Transient reasons a side-effect-free operation may be retried on.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureReason::Unavailable | FailureReason::Timeout)
    }
}

/// A structured failure returned by a back end.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason:?}: {message}")]
pub struct BackendFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl BackendFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(FailureReason::InvalidParameters, message)
    }

    pub fn unknown_operation(backend: &str, operation: &str) -> Self {
        Self::new(
            FailureReason::UnknownOperation,
            format!("{backend} has no operation '{operation}'"),
        )
    }
}

/// The core back-end trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The unique name of this back end (e.g., "fs", "memory").
    fn name(&self) -> &str;

    /// The operations this back end exposes.
    fn operations(&self) -> Vec<OperationSpec>;

    /// Run one operation. Success payloads are free-form JSON.
    async fn invoke(
        &self,
        operation: &str,
        parameters: &Parameters,
    ) -> std::result::Result<serde_json::Value, BackendFailure>;
}

/// A registry of available back ends.
///
/// The scheduler uses this to:
/// 1. Narrow the operation catalogue to an item's allowed back ends
/// 2. Look up and invoke back ends during execution
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a back end. Replaces any existing back end with the same name.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        self.backends.insert(name, backend);
    }

    /// Get a back end by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    /// Look up the catalogue entry for one operation.
    pub fn operation(&self, backend: &str, operation: &str) -> Option<OperationSpec> {
        self.backends
            .get(backend)?
            .operations()
            .into_iter()
            .find(|op| op.name == operation)
    }

    /// Every operation of every registered back end.
    pub fn catalogue(&self) -> Vec<OperationSpec> {
        let mut ops: Vec<OperationSpec> = self
            .backends
            .values()
            .flat_map(|b| b.operations())
            .collect();
        ops.sort_by(|a, b| (&a.backend, &a.name).cmp(&(&b.backend, &b.name)));
        ops
    }

    /// The catalogue narrowed to the given back ends. Pure filter.
    pub fn catalogue_for(&self, allowed: &BTreeSet<String>) -> Vec<OperationSpec> {
        self.catalogue()
            .into_iter()
            .filter(|op| allowed.contains(&op.backend))
            .collect()
    }

    /// List all registered back-end names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
