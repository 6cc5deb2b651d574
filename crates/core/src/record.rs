use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::{EntityKind, RecordInstanceIdentifier, RemoteId};

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Language / workspace dimension a record is written in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub language: Option<String>,
    pub workspace: Option<i64>,
}

impl Context {
    pub fn language(language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            workspace: None,
        }
    }
}

/// Normalized input for one record operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRepresentation {
    identifier: RecordInstanceIdentifier,
    fields: FieldMap,
    context: Context,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    kind: &'a EntityKind,
    fields: &'a FieldMap,
    context: &'a Context,
}

impl RecordRepresentation {
    /// Builds a representation, rejecting blank or padded field names.
    pub fn new(
        identifier: RecordInstanceIdentifier,
        fields: FieldMap,
        context: Context,
    ) -> Result<Self, CoreError> {
        for name in fields.keys() {
            if name.trim().is_empty() {
                return Err(CoreError::InvalidField {
                    field: name.clone(),
                    reason: "field name must not be blank".into(),
                });
            }
            if name.trim() != name {
                return Err(CoreError::InvalidField {
                    field: name.clone(),
                    reason: "field name must not carry surrounding whitespace".into(),
                });
            }
        }
        Ok(Self {
            identifier,
            fields,
            context,
        })
    }

    pub fn parse(
        kind: &str,
        remote_id: &str,
        fields: FieldMap,
        context: Context,
    ) -> Result<Self, CoreError> {
        let identifier =
            RecordInstanceIdentifier::new(EntityKind::parse(kind)?, RemoteId::parse(remote_id)?);
        Self::new(identifier, fields, context)
    }

    pub fn identifier(&self) -> &RecordInstanceIdentifier {
        &self.identifier
    }

    pub fn kind(&self) -> &EntityKind {
        &self.identifier.kind
    }

    pub fn remote_id(&self) -> &RemoteId {
        &self.identifier.remote_id
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// BLAKE3 over the MessagePack encoding of kind, fields and context.
    /// Field order is canonical because `FieldMap` is ordered.
    pub fn fingerprint(&self) -> Result<[u8; 32], CoreError> {
        let bytes = rmp_serde::to_vec(&FingerprintInput {
            kind: &self.identifier.kind,
            fields: &self.fields,
            context: &self.context,
        })
        .map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parse_builds_identifier() {
        let rep = RecordRepresentation::parse(
            "pages",
            "page-1",
            fields(&[("title", FieldValue::Text("Home".into()))]),
            Context::default(),
        )
        .unwrap();
        assert_eq!(rep.kind().as_str(), "pages");
        assert_eq!(rep.remote_id().as_str(), "page-1");
        assert_eq!(rep.field("title"), Some(&FieldValue::Text("Home".into())));
    }

    #[test]
    fn blank_field_name_rejected() {
        let result = RecordRepresentation::parse(
            "pages",
            "page-1",
            fields(&[(" ", FieldValue::Null)]),
            Context::default(),
        );
        assert!(matches!(result, Err(CoreError::InvalidField { .. })));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = RecordRepresentation::parse(
            "pages",
            "page-1",
            fields(&[
                ("title", FieldValue::Text("Home".into())),
                ("sorting", FieldValue::Integer(3)),
            ]),
            Context::default(),
        )
        .unwrap();
        let b = a.clone();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let c = RecordRepresentation::parse(
            "pages",
            "page-1",
            fields(&[
                ("title", FieldValue::Text("Home".into())),
                ("sorting", FieldValue::Integer(4)),
            ]),
            Context::default(),
        )
        .unwrap();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());

        let d = RecordRepresentation::parse(
            "pages",
            "page-1",
            a.fields().clone(),
            Context::language("de"),
        )
        .unwrap();
        assert_ne!(a.fingerprint().unwrap(), d.fingerprint().unwrap());
    }
}
