//! File system back end — read, list and write files inside a sandbox root.
//!
//! Every path is relative to the root. Absolute paths and `..`
//! components are rejected before touching the disk, and the resolved
//! path is canonicalized so symlinks cannot lead outside the root.

use crate::params::{optional_str, required_str};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::io;
use std::path::{Component, Path, PathBuf};
use taskpilot_core::{Backend, BackendFailure, FailureReason, OperationSpec, Parameters};
use tracing::debug;

pub const NAME: &str = "fs";

pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a caller-supplied relative path to a path inside the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, BackendFailure> {
        let normalized = path.replace('\\', "/");
        let relative = Path::new(&normalized);

        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(BackendFailure::new(
                FailureReason::PermissionDenied,
                format!("path '{path}' leaves the sandbox"),
            ));
        }

        let root = self.root.canonicalize().map_err(|e| {
            BackendFailure::new(
                FailureReason::Unavailable,
                format!("sandbox root {} unusable: {e}", self.root.display()),
            )
        })?;
        let joined = root.join(relative);

        // Resolve symlinks on whatever part of the path already exists
        let canonical = if joined.exists() {
            joined.canonicalize().ok()
        } else {
            joined
                .parent()
                .filter(|parent| parent.exists())
                .and_then(|parent| parent.canonicalize().ok())
        };
        if let Some(canonical) = canonical
            && !canonical.starts_with(&root)
        {
            return Err(BackendFailure::new(
                FailureReason::PermissionDenied,
                format!("path '{path}' resolves outside the sandbox"),
            ));
        }

        Ok(joined)
    }

    async fn read_file(&self, parameters: &Parameters) -> Result<Value, BackendFailure> {
        let path = required_str(parameters, "path")?;
        let resolved = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_failure(path, &e))?;
        Ok(json!({ "path": path, "bytes": content.len(), "content": content }))
    }

    async fn list_dir(&self, parameters: &Parameters) -> Result<Value, BackendFailure> {
        let path = optional_str(parameters, "path")?.unwrap_or(".");
        let resolved = self.resolve(path)?;
        let mut dir = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| io_failure(path, &e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_failure(path, &e))? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        entries.sort();

        let entries: Vec<Value> = entries
            .into_iter()
            .map(|(name, is_dir)| {
                json!({ "name": name, "kind": if is_dir { "dir" } else { "file" } })
            })
            .collect();
        Ok(json!({ "path": path, "entries": entries }))
    }

    async fn write_file(&self, parameters: &Parameters) -> Result<Value, BackendFailure> {
        let path = required_str(parameters, "path")?;
        let content = required_str(parameters, "content")?;
        let resolved = self.resolve(path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(path, &e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| io_failure(path, &e))?;

        debug!(path, bytes = content.len(), "File written");
        Ok(json!({ "path": path, "bytes": content.len() }))
    }
}

fn io_failure(path: &str, error: &io::Error) -> BackendFailure {
    let reason = match error.kind() {
        io::ErrorKind::NotFound => FailureReason::NotFound,
        io::ErrorKind::PermissionDenied => FailureReason::PermissionDenied,
        io::ErrorKind::TimedOut => FailureReason::Timeout,
        _ => FailureReason::ExecutionFailed,
    };
    BackendFailure::new(reason, format!("{path}: {error}"))
}

#[async_trait]
impl Backend for FsBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec::new(NAME, "read_file")
                .describe("Read the text file at `path`.")
                .read_only(),
            OperationSpec::new(NAME, "list_dir")
                .describe("List the directory at `path` (default: the root).")
                .read_only(),
            OperationSpec::new(NAME, "write_file")
                .describe("Write `content` to `path`, creating parent directories."),
        ]
    }

    async fn invoke(&self, operation: &str, parameters: &Parameters) -> Result<Value, BackendFailure> {
        match operation {
            "read_file" => self.read_file(parameters).await,
            "list_dir" => self.list_dir(parameters).await,
            "write_file" => self.write_file(parameters).await,
            other => Err(BackendFailure::unknown_operation(NAME, other)),
        }
    }
}
