use taskpilot_core::CollaboratorError;

/// Why a submitted request produced no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission queue full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("Timed out after {waited_ms}ms waiting for admission")]
    Timeout { waited_ms: u64 },

    #[error(transparent)]
    Work(CollaboratorError),

    #[error("Gave up after {attempts} attempts: {last}")]
    BackoffExhausted {
        attempts: u32,
        last: CollaboratorError,
    },

    #[error("Batch '{batch_key}' produced a result of a different type")]
    TypeMismatch { batch_key: String },

    #[error("Admission controller shut down")]
    Closed,
}

impl AdmissionError {
    /// Transient admission failures a caller may resubmit after.
    pub fn is_resubmittable(&self) -> bool {
        matches!(
            self,
            AdmissionError::QueueFull { .. } | AdmissionError::Timeout { .. }
        )
    }
}
