use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(OperationId);

macro_rules! text_id {
    ($name:ident, $label:literal) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Trims surrounding whitespace and rejects blank input.
            pub fn parse(raw: &str) -> Result<Self, CoreError> {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(CoreError::InvalidIdentifier(concat!($label, " must not be blank").into()));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = CoreError;

            fn try_from(raw: &str) -> Result<Self, Self::Error> {
                Self::parse(raw)
            }
        }
    };
}

text_id!(RemoteId, "remote id");
text_id!(EntityKind, "entity kind");

/// The host store's own identifier for a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeId(i64);

impl NativeId {
    pub fn new(raw: i64) -> Result<Self, CoreError> {
        if raw <= 0 {
            return Err(CoreError::InvalidIdentifier(format!(
                "native id must be positive, got {raw}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Debug for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeId({})", self.0)
    }
}

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parent location a new record is stored under.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageLocation(i64);

impl StorageLocation {
    /// Placeholder for records that live at the top of the tree.
    pub const TOP_LEVEL: StorageLocation = StorageLocation(0);

    pub fn new(raw: i64) -> Result<Self, CoreError> {
        if raw < 0 {
            return Err(CoreError::InvalidIdentifier(format!(
                "storage location must not be negative, got {raw}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn is_top_level(&self) -> bool {
        self.0 == 0
    }
}

impl From<NativeId> for StorageLocation {
    fn from(id: NativeId) -> Self {
        Self(id.get())
    }
}

impl fmt::Debug for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageLocation({})", self.0)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A store-native record location: entity kind plus native id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: EntityKind,
    pub native_id: NativeId,
}

impl RecordRef {
    pub fn new(kind: EntityKind, native_id: NativeId) -> Self {
        Self { kind, native_id }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.native_id)
    }
}

/// Logical key of one imported record, independent of its native id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordInstanceIdentifier {
    pub kind: EntityKind,
    pub remote_id: RemoteId,
}

impl RecordInstanceIdentifier {
    pub fn new(kind: EntityKind, remote_id: RemoteId) -> Self {
        Self { kind, remote_id }
    }
}

impl fmt::Display for RecordInstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.remote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_id_is_trimmed() {
        let id = RemoteId::parse("  B-42 ").unwrap();
        assert_eq!(id.as_str(), "B-42");
    }

    #[test]
    fn blank_identifiers_rejected() {
        assert!(RemoteId::parse("").is_err());
        assert!(RemoteId::parse(" \t").is_err());
        assert!(EntityKind::parse("").is_err());
    }

    #[test]
    fn native_id_must_be_positive() {
        assert!(NativeId::new(0).is_err());
        assert!(NativeId::new(-3).is_err());
        assert_eq!(NativeId::new(5).unwrap().get(), 5);
    }

    #[test]
    fn top_level_location_is_zero() {
        assert_eq!(StorageLocation::TOP_LEVEL.get(), 0);
        assert!(StorageLocation::TOP_LEVEL.is_top_level());
        assert!(StorageLocation::new(-1).is_err());
    }
}
