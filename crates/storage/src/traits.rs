use remap_core::{
    Context, EntityKind, FieldMap, FieldValue, NativeId, RecordRef, RemoteId, StorageLocation,
};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMapping {
    pub remote_id: RemoteId,
    pub kind: EntityKind,
    pub native_id: NativeId,
    pub fingerprint: Option<[u8; 32]>,
    /// Unix seconds.
    pub bound_at: i64,
    pub touched_at: i64,
}

impl IdentityMapping {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.kind.clone(), self.native_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelation {
    pub kind: EntityKind,
    pub field: String,
    pub owner: NativeId,
    pub target: RemoteId,
}

/// Where a field write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    New { location: StorageLocation },
    Existing(NativeId),
}

/// Bidirectional index between remote ids and native record locations.
pub trait IdentityStore {
    fn resolve(&self, remote_id: &RemoteId) -> Result<Option<RecordRef>, StorageError>;

    fn remote_id_for(
        &self,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<Option<RemoteId>, StorageError>;

    fn mapping(&self, remote_id: &RemoteId) -> Result<Option<IdentityMapping>, StorageError>;

    /// Binds `remote_id` to `(kind, native_id)`.
    ///
    /// Rebinding to the identical location is a no-op. Any other existing
    /// binding for either side fails with `IdentityConflict` or
    /// `LocationAlreadyBound`; the uniqueness is enforced by the store.
    fn bind(
        &mut self,
        remote_id: &RemoteId,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<(), StorageError>;

    /// Removes the mapping. Returns the removed row, if there was one.
    fn unbind(&mut self, remote_id: &RemoteId) -> Result<Option<IdentityMapping>, StorageError>;

    fn set_fingerprint(
        &mut self,
        remote_id: &RemoteId,
        fingerprint: &[u8; 32],
    ) -> Result<(), StorageError>;

    fn touch(&mut self, remote_id: &RemoteId) -> Result<(), StorageError>;

    fn mapping_count(&self) -> Result<u64, StorageError>;
}

/// Relation assignments waiting for their target's identity.
pub trait RelationLedger {
    /// Replaces every pending target of one owner/field slot.
    /// Blank identifiers are dropped and duplicates stored once.
    fn set_slot(
        &mut self,
        kind: &EntityKind,
        field: &str,
        owner: NativeId,
        targets: &[String],
    ) -> Result<(), StorageError>;

    fn find_by_slot(
        &self,
        kind: &EntityKind,
        field: &str,
        owner: NativeId,
    ) -> Result<Vec<PendingRelation>, StorageError>;

    fn find_by_target(&self, target: &RemoteId) -> Result<Vec<PendingRelation>, StorageError>;

    /// Removes and returns every entry waiting on `target`.
    fn take_by_target(&mut self, target: &RemoteId) -> Result<Vec<PendingRelation>, StorageError>;

    /// Removes every entry owned by one record. Returns the number removed.
    fn purge_owner(&mut self, kind: &EntityKind, owner: NativeId) -> Result<u64, StorageError>;

    fn pending_count(&self) -> Result<u64, StorageError>;
}

/// The component that actually writes records.
pub trait PersistenceEngine {
    /// Writes `fields` and returns the record's native id.
    /// Field-level rejections come back as `StorageError::FieldErrors`.
    fn apply_field_changes(
        &mut self,
        kind: &EntityKind,
        target: WriteTarget,
        fields: &FieldMap,
        context: &Context,
    ) -> Result<NativeId, StorageError>;

    fn fetch_field(
        &self,
        kind: &EntityKind,
        native_id: NativeId,
        field: &str,
    ) -> Result<Option<FieldValue>, StorageError>;

    fn delete_record(&mut self, kind: &EntityKind, native_id: NativeId) -> Result<(), StorageError>;

    fn was_deleted(&self, kind: &EntityKind, native_id: NativeId) -> Result<bool, StorageError>;

    /// Toggles reference-index upkeep on writes. Bulk runs switch it off
    /// and call `rebuild_reference_index` once at the end.
    fn set_reference_index_enabled(&mut self, enabled: bool);

    fn reference_index_enabled(&self) -> bool;

    /// Returns the number of index rows written.
    fn rebuild_reference_index(&mut self) -> Result<u64, StorageError>;
}

/// Nested atomic scopes spanning all three stores.
pub trait Scoped {
    fn begin_scope(&mut self, name: &str) -> Result<(), StorageError>;

    fn commit_scope(&mut self, name: &str) -> Result<(), StorageError>;

    fn rollback_scope(&mut self, name: &str) -> Result<(), StorageError>;
}

/// Everything a record operation needs from the storage side.
pub trait Storage: IdentityStore + RelationLedger + PersistenceEngine + Scoped {}

impl<T: IdentityStore + RelationLedger + PersistenceEngine + Scoped> Storage for T {}
