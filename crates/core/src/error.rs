use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}
