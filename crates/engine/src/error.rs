use remap_core::CoreError;
use remap_storage::{FieldError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence engine rejected the write: {}", join_field_errors(.0))]
    Persistence(Vec<FieldError>),

    #[error("aborted by handler `{handler}`: {reason}")]
    Aborted { handler: String, reason: String },

    #[error("operation incomplete, unconsumed required messages: {}", .0.join(", "))]
    Incomplete(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::IdentityConflict { .. } | StorageError::LocationAlreadyBound { .. } => {
                Self::IdentityConflict(err.to_string())
            }
            StorageError::FieldErrors(errors) => Self::Persistence(errors),
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::Core(core) => Self::Core(core),
            other => Self::Storage(other),
        }
    }
}
