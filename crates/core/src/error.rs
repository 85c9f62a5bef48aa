//! Error types for the TaskPilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use crate::item::{ItemId, ItemStatus};
use thiserror::Error;

/// The top-level error type for TaskPilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Collaborator errors ---
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    // --- Work item errors ---
    #[error("Work item error: {0}")]
    Item(#[from] ItemError),

    // --- Back-end errors ---
    #[error("Back-end error: {0}")]
    Backend(#[from] crate::backend::BackendFailure),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised by an external collaborator (planner, verifier, ...).
///
/// `Clone` because one failure may be delivered to every caller sharing a
/// deduplicated admission batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited by service, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Whether the same request may succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Unavailable(_)
                | CollaboratorError::RateLimited { .. }
                | CollaboratorError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("Invalid transition for item {item}: {from} -> {to}")]
    InvalidTransition {
        item: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("Invalid work item {item}: {reason}")]
    InvalidDefinition { item: ItemId, reason: String },
}
