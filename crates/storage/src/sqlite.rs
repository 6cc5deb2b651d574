use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, OptionalExtension};

use remap_core::{
    Context, EntityKind, FieldMap, FieldValue, NativeId, RecordRef, RemoteId, StorageLocation,
};

use crate::error::{FieldError, StorageError};
use crate::traits::{
    IdentityMapping, IdentityStore, PendingRelation, PersistenceEngine, RelationLedger, Scoped,
    WriteTarget,
};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn encode_value(value: &FieldValue) -> Result<Vec<u8>, StorageError> {
    value
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_value(bytes: &[u8]) -> Result<FieldValue, StorageError> {
    FieldValue::from_msgpack(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Savepoint names are spliced into SQL, so only identifier characters pass.
fn checked_scope_name(name: &str) -> Result<&str, StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::Serialization(format!("invalid scope name: {name:?}")))
    }
}

/// A record as the reference persistence adapter stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub native_id: NativeId,
    pub kind: EntityKind,
    pub location: StorageLocation,
    pub language: Option<String>,
    pub workspace: Option<i64>,
    pub deleted: bool,
}

type MappingRow = (String, String, i64, Option<Vec<u8>>, i64, i64);
type PendingRow = (String, String, i64, String);

fn read_pending_row(row: &rusqlite::Row) -> rusqlite::Result<PendingRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn mapping_from_row(row: MappingRow) -> Result<IdentityMapping, StorageError> {
    let (remote_id, kind, native_id, fingerprint, bound_at, touched_at) = row;
    let fingerprint = match fingerprint {
        Some(bytes) => Some(to_array::<32>(bytes, "fingerprint")?),
        None => None,
    };
    Ok(IdentityMapping {
        remote_id: RemoteId::parse(&remote_id)?,
        kind: EntityKind::parse(&kind)?,
        native_id: NativeId::new(native_id)?,
        fingerprint,
        bound_at,
        touched_at,
    })
}

fn pending_from_row(row: PendingRow) -> Result<PendingRelation, StorageError> {
    let (kind, field, owner, target) = row;
    Ok(PendingRelation {
        kind: EntityKind::parse(&kind)?,
        field,
        owner: NativeId::new(owner)?,
        target: RemoteId::parse(&target)?,
    })
}

/// SQLite-backed mapping store, relation ledger and reference persistence
/// engine sharing one connection, so one savepoint covers all three.
pub struct SqliteStorage {
    conn: Connection,
    reference_index: bool,
    required_fields: BTreeMap<EntityKind, BTreeSet<String>>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            reference_index: true,
            required_fields: BTreeMap::new(),
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// New records of `kind` must carry a non-null `field`.
    pub fn require_field(&mut self, kind: &EntityKind, field: &str) {
        self.required_fields
            .entry(kind.clone())
            .or_default()
            .insert(field.to_string());
    }

    pub fn get_record(
        &self,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT location, language, workspace, deleted FROM records WHERE native_id = ?1 AND entity_kind = ?2",
                rusqlite::params![native_id.get(), kind.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((location, language, workspace, deleted)) => Ok(Some(StoredRecord {
                native_id,
                kind: kind.clone(),
                location: StorageLocation::new(location)?,
                language,
                workspace,
                deleted,
            })),
            None => Ok(None),
        }
    }

    pub fn get_fields(&self, native_id: NativeId) -> Result<Vec<(String, FieldValue)>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT field_key, value FROM record_fields WHERE native_id = ?1 ORDER BY field_key")?;
        let rows = stmt.query_map(rusqlite::params![native_id.get()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (key, bytes) = row?;
            result.push((key, decode_value(&bytes)?));
        }
        Ok(result)
    }

    /// Number of live records of one kind.
    pub fn count_records(&self, kind: &EntityKind) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_kind = ?1 AND deleted = 0",
            rusqlite::params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Reference-index rows originating from one record.
    pub fn get_references(&self, native_id: NativeId) -> Result<Vec<(String, RecordRef)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT field_key, target_kind, target_native_id FROM reference_index WHERE native_id = ?1 ORDER BY field_key, target_native_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![native_id.get()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (field, kind, target) = row?;
            result.push((
                field,
                RecordRef::new(EntityKind::parse(&kind)?, NativeId::new(target)?),
            ));
        }
        Ok(result)
    }

    fn is_live(conn: &Connection, target: &RecordRef) -> Result<bool, StorageError> {
        let live: Option<bool> = conn
            .query_row(
                "SELECT deleted = 0 FROM records WHERE native_id = ?1 AND entity_kind = ?2",
                rusqlite::params![target.native_id.get(), target.kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(live.unwrap_or(false))
    }

    fn validate_fields(
        &self,
        kind: &EntityKind,
        target: WriteTarget,
        fields: &FieldMap,
    ) -> Result<(), StorageError> {
        let mut errors = Vec::new();

        if let Some(required) = self.required_fields.get(kind) {
            for name in required {
                match (fields.get(name), target) {
                    (None, WriteTarget::New { .. }) => {
                        errors.push(FieldError::new(name, "field is required"));
                    }
                    (Some(value), _) if value.is_null() => {
                        errors.push(FieldError::new(name, "field must not be null"));
                    }
                    _ => {}
                }
            }
        }

        for (name, value) in fields {
            if let FieldValue::Refs(refs) = value {
                for target in refs {
                    if !Self::is_live(&self.conn, target)? {
                        errors.push(FieldError::new(
                            name,
                            format!("references missing record {target}"),
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StorageError::FieldErrors(errors))
        }
    }

    fn index_references(
        conn: &Connection,
        native_id: NativeId,
        field: &str,
        value: &FieldValue,
    ) -> Result<u64, StorageError> {
        conn.execute(
            "DELETE FROM reference_index WHERE native_id = ?1 AND field_key = ?2",
            rusqlite::params![native_id.get(), field],
        )?;
        let mut written = 0;
        if let FieldValue::Refs(refs) = value {
            for target in refs {
                written += conn.execute(
                    "INSERT OR IGNORE INTO reference_index (native_id, field_key, target_kind, target_native_id) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        native_id.get(),
                        field,
                        target.kind.as_str(),
                        target.native_id.get(),
                    ],
                )? as u64;
            }
        }
        Ok(written)
    }
}

impl IdentityStore for SqliteStorage {
    fn resolve(&self, remote_id: &RemoteId) -> Result<Option<RecordRef>, StorageError> {
        Ok(self.mapping(remote_id)?.map(|m| m.record_ref()))
    }

    fn remote_id_for(
        &self,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<Option<RemoteId>, StorageError> {
        let remote_id: Option<String> = self
            .conn
            .query_row(
                "SELECT remote_id FROM identity_map WHERE entity_kind = ?1 AND native_id = ?2",
                rusqlite::params![kind.as_str(), native_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        match remote_id {
            Some(raw) => Ok(Some(RemoteId::parse(&raw)?)),
            None => Ok(None),
        }
    }

    fn mapping(&self, remote_id: &RemoteId) -> Result<Option<IdentityMapping>, StorageError> {
        let row: Option<MappingRow> = self
            .conn
            .query_row(
                "SELECT remote_id, entity_kind, native_id, fingerprint, bound_at, touched_at FROM identity_map WHERE remote_id = ?1",
                rusqlite::params![remote_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(mapping_from_row).transpose()
    }

    fn bind(
        &mut self,
        remote_id: &RemoteId,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "INSERT INTO identity_map (remote_id, entity_kind, native_id) VALUES (?1, ?2, ?3)",
            rusqlite::params![remote_id.as_str(), kind.as_str(), native_id.get()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, message))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let requested = RecordRef::new(kind.clone(), native_id);
                if let Some(existing) = self.mapping(remote_id)? {
                    if existing.record_ref() == requested {
                        return Ok(());
                    }
                    return Err(StorageError::IdentityConflict {
                        remote_id: remote_id.clone(),
                        existing: existing.record_ref(),
                        requested,
                    });
                }
                match self.remote_id_for(kind, native_id)? {
                    Some(existing) => Err(StorageError::LocationAlreadyBound {
                        location: requested,
                        existing,
                    }),
                    None => Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(
                        err, message,
                    ))),
                }
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn unbind(&mut self, remote_id: &RemoteId) -> Result<Option<IdentityMapping>, StorageError> {
        let existing = self.mapping(remote_id)?;
        if existing.is_some() {
            self.conn.execute(
                "DELETE FROM identity_map WHERE remote_id = ?1",
                rusqlite::params![remote_id.as_str()],
            )?;
        }
        Ok(existing)
    }

    fn set_fingerprint(
        &mut self,
        remote_id: &RemoteId,
        fingerprint: &[u8; 32],
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE identity_map SET fingerprint = ?1, touched_at = unixepoch() WHERE remote_id = ?2",
            rusqlite::params![&fingerprint[..], remote_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("mapping for {remote_id}")));
        }
        Ok(())
    }

    fn touch(&mut self, remote_id: &RemoteId) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE identity_map SET touched_at = unixepoch() WHERE remote_id = ?1",
            rusqlite::params![remote_id.as_str()],
        )?;
        Ok(())
    }

    fn mapping_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identity_map", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl RelationLedger for SqliteStorage {
    fn set_slot(
        &mut self,
        kind: &EntityKind,
        field: &str,
        owner: NativeId,
        targets: &[String],
    ) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        sp.execute(
            "DELETE FROM pending_relations WHERE entity_kind = ?1 AND field_key = ?2 AND owner_native_id = ?3",
            rusqlite::params![kind.as_str(), field, owner.get()],
        )?;
        for target in targets.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            sp.execute(
                "INSERT OR IGNORE INTO pending_relations (entity_kind, field_key, owner_native_id, target_remote_id) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![kind.as_str(), field, owner.get(), target],
            )?;
        }
        sp.commit()?;
        Ok(())
    }

    fn find_by_slot(
        &self,
        kind: &EntityKind,
        field: &str,
        owner: NativeId,
    ) -> Result<Vec<PendingRelation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, field_key, owner_native_id, target_remote_id FROM pending_relations
             WHERE entity_kind = ?1 AND field_key = ?2 AND owner_native_id = ?3 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![kind.as_str(), field, owner.get()],
            read_pending_row,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(pending_from_row(row?)?);
        }
        Ok(result)
    }

    fn find_by_target(&self, target: &RemoteId) -> Result<Vec<PendingRelation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_kind, field_key, owner_native_id, target_remote_id FROM pending_relations
             WHERE target_remote_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(rusqlite::params![target.as_str()], read_pending_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(pending_from_row(row?)?);
        }
        Ok(result)
    }

    fn take_by_target(&mut self, target: &RemoteId) -> Result<Vec<PendingRelation>, StorageError> {
        let taken = self.find_by_target(target)?;
        self.conn.execute(
            "DELETE FROM pending_relations WHERE target_remote_id = ?1",
            rusqlite::params![target.as_str()],
        )?;
        Ok(taken)
    }

    fn purge_owner(&mut self, kind: &EntityKind, owner: NativeId) -> Result<u64, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM pending_relations WHERE entity_kind = ?1 AND owner_native_id = ?2",
            rusqlite::params![kind.as_str(), owner.get()],
        )?;
        Ok(removed as u64)
    }

    fn pending_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_relations", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl PersistenceEngine for SqliteStorage {
    fn apply_field_changes(
        &mut self,
        kind: &EntityKind,
        target: WriteTarget,
        fields: &FieldMap,
        context: &Context,
    ) -> Result<NativeId, StorageError> {
        self.validate_fields(kind, target, fields)?;
        let reference_index = self.reference_index;

        let sp = self.conn.savepoint()?;
        let native_id = match target {
            WriteTarget::New { location } => {
                sp.execute(
                    "INSERT INTO records (entity_kind, location, language, workspace) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        kind.as_str(),
                        location.get(),
                        context.language.as_deref(),
                        context.workspace,
                    ],
                )?;
                NativeId::new(sp.last_insert_rowid())?
            }
            WriteTarget::Existing(native_id) => {
                let changed = sp.execute(
                    "UPDATE records SET updated_at = unixepoch() WHERE native_id = ?1 AND entity_kind = ?2 AND deleted = 0",
                    rusqlite::params![native_id.get(), kind.as_str()],
                )?;
                if changed == 0 {
                    return Err(StorageError::NotFound(format!("{kind}:{native_id}")));
                }
                native_id
            }
        };

        for (field, value) in fields {
            sp.execute(
                "INSERT INTO record_fields (native_id, field_key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(native_id, field_key) DO UPDATE SET value = excluded.value",
                rusqlite::params![native_id.get(), field, encode_value(value)?],
            )?;
            if reference_index {
                Self::index_references(&sp, native_id, field, value)?;
            }
        }

        sp.commit()?;
        Ok(native_id)
    }

    fn fetch_field(
        &self,
        kind: &EntityKind,
        native_id: NativeId,
        field: &str,
    ) -> Result<Option<FieldValue>, StorageError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT f.value FROM record_fields f JOIN records r ON r.native_id = f.native_id
                 WHERE r.native_id = ?1 AND r.entity_kind = ?2 AND f.field_key = ?3",
                rusqlite::params![native_id.get(), kind.as_str(), field],
                |row| row.get(0),
            )
            .optional()?;
        bytes.map(|b| decode_value(&b)).transpose()
    }

    fn delete_record(&mut self, kind: &EntityKind, native_id: NativeId) -> Result<(), StorageError> {
        let reference_index = self.reference_index;
        let sp = self.conn.savepoint()?;
        let changed = sp.execute(
            "UPDATE records SET deleted = 1, updated_at = unixepoch() WHERE native_id = ?1 AND entity_kind = ?2 AND deleted = 0",
            rusqlite::params![native_id.get(), kind.as_str()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("{kind}:{native_id}")));
        }
        if reference_index {
            sp.execute(
                "DELETE FROM reference_index WHERE native_id = ?1",
                rusqlite::params![native_id.get()],
            )?;
        }
        sp.commit()?;
        Ok(())
    }

    /// A record that was never stored counts as deleted.
    fn was_deleted(&self, kind: &EntityKind, native_id: NativeId) -> Result<bool, StorageError> {
        let deleted: Option<bool> = self
            .conn
            .query_row(
                "SELECT deleted FROM records WHERE native_id = ?1 AND entity_kind = ?2",
                rusqlite::params![native_id.get(), kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(deleted.unwrap_or(true))
    }

    fn set_reference_index_enabled(&mut self, enabled: bool) {
        self.reference_index = enabled;
    }

    fn reference_index_enabled(&self) -> bool {
        self.reference_index
    }

    fn rebuild_reference_index(&mut self) -> Result<u64, StorageError> {
        let sp = self.conn.savepoint()?;
        sp.execute("DELETE FROM reference_index", [])?;

        let rows: Vec<(i64, String, Vec<u8>)> = {
            let mut stmt = sp.prepare(
                "SELECT f.native_id, f.field_key, f.value FROM record_fields f
                 JOIN records r ON r.native_id = f.native_id WHERE r.deleted = 0",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut written = 0;
        for (native_id, field, bytes) in rows {
            let value = decode_value(&bytes)?;
            if matches!(value, FieldValue::Refs(_)) {
                written += Self::index_references(&sp, NativeId::new(native_id)?, &field, &value)?;
            }
        }

        sp.commit()?;
        Ok(written)
    }
}

impl Scoped for SqliteStorage {
    fn begin_scope(&mut self, name: &str) -> Result<(), StorageError> {
        let name = checked_scope_name(name)?;
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(())
    }

    fn commit_scope(&mut self, name: &str) -> Result<(), StorageError> {
        let name = checked_scope_name(name)?;
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }

    fn rollback_scope(&mut self, name: &str) -> Result<(), StorageError> {
        let name = checked_scope_name(name)?;
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(s: &str) -> EntityKind {
        EntityKind::parse(s).unwrap()
    }

    fn rid(s: &str) -> RemoteId {
        RemoteId::parse(s).unwrap()
    }

    fn nid(n: i64) -> NativeId {
        NativeId::new(n).unwrap()
    }

    #[test]
    fn bind_round_trip() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();

        assert_eq!(
            storage.resolve(&rid("X")).unwrap(),
            Some(RecordRef::new(kind("table"), nid(5)))
        );
        assert_eq!(
            storage.remote_id_for(&kind("table"), nid(5)).unwrap(),
            Some(rid("X"))
        );
    }

    #[test]
    fn identical_rebind_is_noop() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        assert_eq!(storage.mapping_count().unwrap(), 1);
    }

    #[test]
    fn rebind_to_other_location_conflicts() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();

        let err = storage.bind(&rid("X"), &kind("table"), nid(6)).unwrap_err();
        assert!(matches!(err, StorageError::IdentityConflict { .. }));

        let err = storage.bind(&rid("X"), &kind("other"), nid(5)).unwrap_err();
        assert!(matches!(err, StorageError::IdentityConflict { .. }));

        // Mapping untouched
        assert_eq!(
            storage.resolve(&rid("X")).unwrap(),
            Some(RecordRef::new(kind("table"), nid(5)))
        );
    }

    #[test]
    fn second_remote_id_for_same_location_rejected() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        let err = storage.bind(&rid("Y"), &kind("table"), nid(5)).unwrap_err();
        assert!(matches!(err, StorageError::LocationAlreadyBound { .. }));
    }

    #[test]
    fn unbind_returns_removed_mapping() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();

        let removed = storage.unbind(&rid("X")).unwrap().unwrap();
        assert_eq!(removed.native_id, nid(5));
        assert_eq!(storage.resolve(&rid("X")).unwrap(), None);
        assert!(storage.unbind(&rid("X")).unwrap().is_none());
    }

    #[test]
    fn fingerprint_roundtrip() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        assert_eq!(storage.mapping(&rid("X")).unwrap().unwrap().fingerprint, None);

        storage.set_fingerprint(&rid("X"), &[7u8; 32]).unwrap();
        assert_eq!(
            storage.mapping(&rid("X")).unwrap().unwrap().fingerprint,
            Some([7u8; 32])
        );

        assert!(matches!(
            storage.set_fingerprint(&rid("missing"), &[0u8; 32]),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn set_slot_drops_blank_targets() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .set_slot(
                &kind("k"),
                "f",
                nid(1),
                &["r1".to_string(), "".to_string(), "".to_string()],
            )
            .unwrap();

        let pending = storage.find_by_slot(&kind("k"), "f", nid(1)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, rid("r1"));
    }

    #[test]
    fn set_slot_replaces_previous_targets() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("k");
        storage
            .set_slot(&k, "f", nid(1), &["a".to_string(), "b".to_string()])
            .unwrap();
        storage.set_slot(&k, "f", nid(1), &["c".to_string()]).unwrap();

        let targets: Vec<_> = storage
            .find_by_slot(&k, "f", nid(1))
            .unwrap()
            .into_iter()
            .map(|p| p.target)
            .collect();
        assert_eq!(targets, vec![rid("c")]);

        storage.set_slot(&k, "f", nid(1), &[]).unwrap();
        assert_eq!(storage.pending_count().unwrap(), 0);
    }

    #[test]
    fn set_slot_leaves_other_slots_alone() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("k");
        storage.set_slot(&k, "f", nid(1), &["a".to_string()]).unwrap();
        storage.set_slot(&k, "g", nid(1), &["a".to_string()]).unwrap();
        storage.set_slot(&k, "f", nid(2), &["a".to_string()]).unwrap();

        storage.set_slot(&k, "f", nid(1), &[]).unwrap();
        assert_eq!(storage.find_by_target(&rid("a")).unwrap().len(), 2);
    }

    #[test]
    fn take_by_target_removes_entries() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .set_slot(&kind("k"), "f", nid(1), &["a".to_string(), "b".to_string()])
            .unwrap();

        let taken = storage.take_by_target(&rid("a")).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].owner, nid(1));
        assert!(storage.find_by_target(&rid("a")).unwrap().is_empty());
        assert_eq!(storage.pending_count().unwrap(), 1);
    }

    #[test]
    fn apply_and_fetch_fields() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("pages");
        let mut fields = FieldMap::new();
        fields.insert("title".into(), FieldValue::Text("Home".into()));

        let id = storage
            .apply_field_changes(
                &k,
                WriteTarget::New {
                    location: StorageLocation::new(3).unwrap(),
                },
                &fields,
                &Context::language("en"),
            )
            .unwrap();

        let record = storage.get_record(&k, id).unwrap().unwrap();
        assert_eq!(record.location.get(), 3);
        assert_eq!(record.language.as_deref(), Some("en"));
        assert_eq!(
            storage.fetch_field(&k, id, "title").unwrap(),
            Some(FieldValue::Text("Home".into()))
        );
        assert_eq!(storage.fetch_field(&kind("other"), id, "title").unwrap(), None);
    }

    #[test]
    fn required_field_reported() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("pages");
        storage.require_field(&k, "title");

        let err = storage
            .apply_field_changes(
                &k,
                WriteTarget::New {
                    location: StorageLocation::TOP_LEVEL,
                },
                &FieldMap::new(),
                &Context::default(),
            )
            .unwrap_err();
        match err {
            StorageError::FieldErrors(errors) => {
                assert_eq!(errors, vec![FieldError::new("title", "field is required")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.count_records(&k).unwrap(), 0);
    }

    #[test]
    fn delete_marks_record_deleted() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let k = kind("pages");
        let id = storage
            .apply_field_changes(
                &k,
                WriteTarget::New {
                    location: StorageLocation::TOP_LEVEL,
                },
                &FieldMap::new(),
                &Context::default(),
            )
            .unwrap();
        assert!(!storage.was_deleted(&k, id).unwrap());

        storage.delete_record(&k, id).unwrap();
        assert!(storage.was_deleted(&k, id).unwrap());
        assert!(matches!(
            storage.delete_record(&k, id),
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.was_deleted(&k, nid(999)).unwrap());
    }

    #[test]
    fn rollback_scope_discards_writes() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.begin_scope("op").unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        storage.rollback_scope("op").unwrap();
        assert_eq!(storage.mapping_count().unwrap(), 0);

        storage.begin_scope("op").unwrap();
        storage.bind(&rid("X"), &kind("table"), nid(5)).unwrap();
        storage.commit_scope("op").unwrap();
        assert_eq!(storage.mapping_count().unwrap(), 1);
    }

    #[test]
    fn scope_names_are_checked() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.begin_scope("op; DROP TABLE records").is_err());
    }
}
