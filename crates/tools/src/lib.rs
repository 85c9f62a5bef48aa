//! Tool execution for TaskPilot.
//!
//! The [`ToolExecutor`] runs tool plans against the back ends in a
//! [`BackendRegistry`], screening every list through the loop guard
//! first. Two built-in back ends are provided for the CLI and tests:
//! an in-memory key-value store and a sandboxed file system.

pub mod executor;
pub mod fs;
pub mod memory;
mod params;

use std::path::PathBuf;
use std::sync::Arc;
use taskpilot_core::BackendRegistry;

pub use executor::{ExecutionReport, InvocationOutcome, InvocationRecord, ToolExecutor};
pub use fs::FsBackend;
pub use memory::MemoryBackend;

/// Create a registry with the built-in back ends.
///
/// The `fs` back end is confined to `root`.
pub fn default_registry(root: impl Into<PathBuf>) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(MemoryBackend::new()));
    registry.register(Arc::new(FsBackend::new(root)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry(".");
        assert_eq!(registry.names(), vec!["fs", "memory"]);
        assert_eq!(registry.catalogue().len(), 7);
        assert!(registry.operation("fs", "read_file").unwrap().side_effect_free);
        assert!(!registry.operation("memory", "set").unwrap().side_effect_free);
    }
}
