use remap_core::{RecordRef, RemoteId};
use thiserror::Error;

/// One field rejected by the persistence engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote id {remote_id} is bound to {existing}, cannot bind it to {requested}")]
    IdentityConflict {
        remote_id: RemoteId,
        existing: RecordRef,
        requested: RecordRef,
    },

    #[error("{location} is already bound to remote id {existing}")]
    LocationAlreadyBound {
        location: RecordRef,
        existing: RemoteId,
    },

    #[error("field validation failed: {}", join_field_errors(.0))]
    FieldErrors(Vec<FieldError>),

    #[error("core error: {0}")]
    Core(#[from] remap_core::CoreError),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
