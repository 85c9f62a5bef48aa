//! Tool invocations — the ephemeral calls a tool plan proposes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One proposed call to a named back end.
///
/// Parameters live in a `BTreeMap`, so keys are unique and iterate in
/// sorted order; the canonical key relies on that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub backend: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ToolInvocation {
    pub fn new(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            operation: operation.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter (builder style).
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Order-independent identity used for repetition comparison.
    ///
    /// Nested objects are normalized as well: `serde_json::Map` is sorted
    /// unless the `preserve_order` feature is enabled, which this
    /// workspace does not do.
    pub fn canonical_key(&self) -> String {
        let params = serde_json::to_string(&self.parameters).unwrap_or_default();
        format!("{}::{}::{}", self.backend, self.operation, params)
    }

    /// The `(backend, operation)` pair used for cumulative counting.
    pub fn operation_key(&self) -> (String, String) {
        (self.backend.clone(), self.operation.clone())
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.backend, self.operation)
    }
}

/// A tool plan as produced by the tool planner or adjuster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPlan {
    #[serde(default)]
    pub invocations: Vec<ToolInvocation>,

    /// The planner asks for the item to be split instead of executed
    #[serde(default)]
    pub needs_split: bool,
}

impl ToolPlan {
    pub fn new(invocations: Vec<ToolInvocation>) -> Self {
        Self {
            invocations,
            needs_split: false,
        }
    }

    /// A plan signalling that the item is too coarse to execute.
    pub fn split() -> Self {
        Self {
            invocations: Vec::new(),
            needs_split: true,
        }
    }

    /// Whether this plan must not be executed as-is.
    pub fn exceeds(&self, max_invocations: usize) -> bool {
        self.needs_split || self.invocations.len() > max_invocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_key_ignores_parameter_order() {
        let a = ToolInvocation::new("fs", "read_file")
            .with_param("path", json!("a.txt"))
            .with_param("encoding", json!("utf8"));
        let b = ToolInvocation::new("fs", "read_file")
            .with_param("encoding", json!("utf8"))
            .with_param("path", json!("a.txt"));
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn canonical_key_normalizes_nested_objects() {
        let a = ToolInvocation::new("kv", "set").with_param("value", json!({"x": 1, "y": 2}));
        let b: ToolInvocation = serde_json::from_str(
            r#"{"backend":"kv","operation":"set","parameters":{"value":{"y":2,"x":1}}}"#,
        )
        .unwrap();
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn canonical_key_distinguishes_values() {
        let a = ToolInvocation::new("fs", "read_file").with_param("path", json!("a"));
        let b = ToolInvocation::new("fs", "read_file").with_param("path", json!("b"));
        assert_ne!(a.canonical_key(), b.canonical_key());
        assert_eq!(a.operation_key(), b.operation_key());
    }

    #[test]
    fn plan_size_limits() {
        let call = ToolInvocation::new("fs", "list_dir");
        assert!(!ToolPlan::new(vec![call.clone(); 5]).exceeds(5));
        assert!(ToolPlan::new(vec![call; 6]).exceeds(5));
        assert!(ToolPlan::split().exceeds(5));
    }

    #[test]
    fn display_names_backend_and_operation() {
        assert_eq!(ToolInvocation::new("fs", "read_file").to_string(), "fs.read_file");
    }
}
