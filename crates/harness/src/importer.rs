use remap_core::{Context, EntityKind, FieldMap, FieldValue, NativeId, RecordRef, RemoteId};
use remap_engine::{Completion, Engine, EngineConfig, OperationResult, Verb, WriteRequest};
use remap_storage::{IdentityStore, PersistenceEngine, RelationLedger, SqliteStorage, StorageError};

/// Builds a field map from literal pairs.
pub fn fields(pairs: Vec<(&str, FieldValue)>) -> FieldMap {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Unwraps a completed result, turning deferrals and failures into errors.
pub fn expect_completed(result: OperationResult) -> Result<Completion, Box<dyn std::error::Error>> {
    match result {
        OperationResult::Completed(completion) => Ok(completion),
        OperationResult::Deferred(deferral) => {
            Err(format!("operation deferred: {}", deferral.reason).into())
        }
        OperationResult::Failed(failed) => Err(Box::new(failed.error)),
    }
}

/// An engine over an in-memory database.
pub struct TestImporter {
    pub engine: Engine,
}

impl TestImporter {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = SqliteStorage::open_in_memory()?;
        Ok(Self {
            engine: Engine::new(config, storage)?,
        })
    }

    pub fn storage(&self) -> &SqliteStorage {
        self.engine.storage()
    }

    pub fn submit(
        &mut self,
        verb: Verb,
        kind: &str,
        remote_id: &str,
        pairs: Vec<(&str, FieldValue)>,
    ) -> OperationResult {
        self.engine
            .submit(WriteRequest::new(verb, kind, remote_id, fields(pairs)))
    }

    /// Creates a record and returns where it landed.
    pub fn create_record(
        &mut self,
        kind: &str,
        remote_id: &str,
        pairs: Vec<(&str, FieldValue)>,
    ) -> Result<RecordRef, Box<dyn std::error::Error>> {
        let result = self
            .engine
            .create(kind, remote_id, fields(pairs), Context::default());
        Ok(expect_completed(result)?.record)
    }

    pub fn resolve(&self, remote_id: &str) -> Result<Option<RecordRef>, Box<dyn std::error::Error>> {
        Ok(self.storage().resolve(&RemoteId::parse(remote_id)?)?)
    }

    pub fn field(&self, record: &RecordRef, name: &str) -> Result<Option<FieldValue>, StorageError> {
        self.storage()
            .fetch_field(&record.kind, record.native_id, name)
    }

    /// Remote ids still pending for one owner/field slot.
    pub fn pending_targets(
        &self,
        record: &RecordRef,
        field: &str,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage()
            .find_by_slot(&record.kind, field, record.native_id)?
            .into_iter()
            .map(|p| p.target.to_string())
            .collect())
    }

    pub fn kind(name: &str) -> Result<EntityKind, Box<dyn std::error::Error>> {
        Ok(EntityKind::parse(name)?)
    }

    pub fn native(raw: i64) -> Result<NativeId, Box<dyn std::error::Error>> {
        Ok(NativeId::new(raw)?)
    }
}
