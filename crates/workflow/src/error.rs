use taskpilot_admission::AdmissionError;
use taskpilot_core::{ItemError, ItemId};
use thiserror::Error;

/// A workflow definition that cannot be run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("Duplicate item id {0}")]
    DuplicateItem(ItemId),

    #[error("Item {item} depends on unknown item {dependency}")]
    UnknownDependency { item: ItemId, dependency: ItemId },

    #[error("Invalid item: {0}")]
    InvalidItem(#[from] ItemError),
}

/// Why a single item stopped in `Aborted`.
#[derive(Debug, Error)]
pub(crate) enum StageError {
    #[error("{stage} call failed: {source}")]
    Collaborator {
        stage: &'static str,
        source: AdmissionError,
    },

    #[error(transparent)]
    Item(#[from] ItemError),

    #[error("No operations available for back ends {0:?}")]
    EmptyCatalogue(Vec<String>),

    #[error("Tool plan names {backend}.{operation}, which is not in the selected catalogue")]
    UnselectedOperation { backend: String, operation: String },
}
