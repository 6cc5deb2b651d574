//! Caller-facing view of failed operations.
//!
//! Every failure the caller can act on gets a category and an HTTP-style
//! status. Storage and serialization failures have no caller-facing meaning
//! and are handed back untranslated.

use serde::Serialize;

use remap_core::CoreError;

use crate::error::EngineError;
use crate::operation::{FailedOperation, RequestContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Argument,
    IdentityConflict,
    NotFound,
    Persistence,
    Incomplete,
}

impl ErrorCategory {
    pub fn status(&self) -> u16 {
        match self {
            Self::IdentityConflict => 409,
            Self::NotFound => 404,
            Self::Argument | Self::Persistence | Self::Incomplete => 400,
        }
    }

    fn of(error: &EngineError) -> Option<Self> {
        match error {
            EngineError::InvalidArgument(_) | EngineError::Aborted { .. } => Some(Self::Argument),
            EngineError::Core(CoreError::InvalidIdentifier(_) | CoreError::InvalidField { .. }) => {
                Some(Self::Argument)
            }
            EngineError::IdentityConflict(_) => Some(Self::IdentityConflict),
            EngineError::NotFound(_) => Some(Self::NotFound),
            EngineError::Persistence(_) => Some(Self::Persistence),
            EngineError::Incomplete(_) => Some(Self::Incomplete),
            EngineError::Core(CoreError::Serialization(_))
            | EngineError::Storage(_)
            | EngineError::Config(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiFieldError {
    pub field: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub category: ErrorCategory,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<ApiFieldError>,
    pub request: RequestContext,
}

impl ApiError {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()).into())
    }
}

impl TryFrom<FailedOperation> for ApiError {
    /// Untranslatable failures come back as they went in.
    type Error = FailedOperation;

    fn try_from(failed: FailedOperation) -> Result<Self, Self::Error> {
        let Some(category) = ErrorCategory::of(&failed.error) else {
            return Err(failed);
        };
        let field_errors = match &failed.error {
            EngineError::Persistence(errors) => errors
                .iter()
                .map(|e| ApiFieldError {
                    field: e.field.clone(),
                    message: e.message.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            category,
            status: category.status(),
            message: failed.error.to_string(),
            field_errors,
            request: failed.request,
        })
    }
}

/// Shorthand for `ApiError::try_from`.
pub fn translate(failed: FailedOperation) -> Result<ApiError, FailedOperation> {
    ApiError::try_from(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remap_core::{Context, OperationId};
    use remap_storage::{FieldError, StorageError};

    use crate::operation::Verb;

    fn failed(error: EngineError) -> FailedOperation {
        FailedOperation {
            request: RequestContext {
                operation_id: OperationId::new(),
                verb: Verb::Create,
                kind: "pages".into(),
                remote_id: "page-1".into(),
                context: Context::language("en"),
            },
            error,
        }
    }

    fn status_of(error: EngineError) -> Option<u16> {
        translate(failed(error)).ok().map(|api| api.status)
    }

    #[test]
    fn statuses() {
        assert_eq!(status_of(EngineError::IdentityConflict("x".into())), Some(409));
        assert_eq!(status_of(EngineError::NotFound("x".into())), Some(404));
        assert_eq!(status_of(EngineError::InvalidArgument("x".into())), Some(400));
        assert_eq!(status_of(EngineError::Incomplete(vec!["Audit".into()])), Some(400));
        assert_eq!(
            status_of(EngineError::Aborted {
                handler: "guard".into(),
                reason: "no".into()
            }),
            Some(400)
        );
        assert_eq!(
            status_of(EngineError::Core(CoreError::InvalidIdentifier("blank".into()))),
            Some(400)
        );
    }

    #[test]
    fn storage_failures_pass_through() {
        let result = translate(failed(EngineError::Storage(StorageError::Serialization(
            "bad bytes".into(),
        ))));
        let back = result.unwrap_err();
        assert!(matches!(back.error, EngineError::Storage(_)));
        assert_eq!(back.request.remote_id, "page-1");

        assert!(translate(failed(EngineError::Core(CoreError::Serialization("x".into())))).is_err());
    }

    #[test]
    fn persistence_errors_carry_fields_and_request() {
        let api = translate(failed(EngineError::Persistence(vec![FieldError::new(
            "title",
            "field is required",
        )])))
        .unwrap();

        assert_eq!(api.category, ErrorCategory::Persistence);
        assert_eq!(api.status, 400);
        assert_eq!(api.field_errors.len(), 1);
        assert_eq!(api.request.kind, "pages");

        let json: serde_json::Value = serde_json::from_str(&api.to_json().unwrap()).unwrap();
        assert_eq!(json["category"], "persistence");
        assert_eq!(json["status"], 400);
        assert_eq!(json["field_errors"][0]["field"], "title");
        assert_eq!(json["request"]["verb"], "create");
        assert_eq!(json["request"]["context"]["language"], "en");
    }
}
