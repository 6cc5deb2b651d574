use serde::{Deserialize, Serialize};

use crate::ids::RecordRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    TextList(Vec<String>),
    Refs(Vec<RecordRef>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::TextList(a), Self::TextList(b)) => a == b,
            (Self::Refs(a), Self::Refs(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_refs(&self) -> Option<&[RecordRef]> {
        match self {
            FieldValue::Refs(refs) => Some(refs),
            _ => None,
        }
    }

    /// Remote ids carried by an inbound relation value.
    ///
    /// `Text` is split on commas, `TextList` is taken item by item. Blank
    /// entries are dropped. Any other variant yields `None`.
    pub fn remote_ids(&self) -> Option<Vec<String>> {
        let raw: Vec<&str> = match self {
            FieldValue::Null => Vec::new(),
            FieldValue::Text(s) => s.split(',').collect(),
            FieldValue::TextList(items) => items.iter().map(String::as_str).collect(),
            _ => return None,
        };
        Some(
            raw.into_iter()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated_text_yields_remote_ids() {
        let value = FieldValue::Text("a1, b2,,  ".into());
        assert_eq!(value.remote_ids(), Some(vec!["a1".to_string(), "b2".to_string()]));
    }

    #[test]
    fn text_list_drops_blank_entries() {
        let value = FieldValue::TextList(vec!["r1".into(), "".into(), " ".into()]);
        assert_eq!(value.remote_ids(), Some(vec!["r1".to_string()]));
    }

    #[test]
    fn null_is_an_empty_relation() {
        assert_eq!(FieldValue::Null.remote_ids(), Some(Vec::new()));
    }

    #[test]
    fn scalar_values_are_not_relations() {
        assert_eq!(FieldValue::Integer(4).remote_ids(), None);
        assert_eq!(FieldValue::Boolean(true).remote_ids(), None);
    }
}
