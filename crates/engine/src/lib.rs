pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod operation;
mod relations;
pub mod translate;

pub use config::{EngineConfig, KindConfig};
pub use error::EngineError;
pub use handler::{HandlerContext, HandlerDecision, OperationHandler, RecordObserver};
pub use message::{Message, MessageChannel, RelationsDeferred};
pub use operation::{
    Collaborators, Completion, Deferral, FailedOperation, OperationResult, OperationState,
    RecordOperation, RequestContext, Verb,
};
pub use translate::{ApiError, ApiFieldError, ErrorCategory, translate};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use remap_core::{Context, EntityKind, FieldMap, NativeId, OperationId, RecordRef, RecordRepresentation, RemoteId};
use remap_storage::{PendingRelation, SqliteStorage, Storage};

/// One write as submitted by a caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub verb: Verb,
    pub kind: String,
    pub remote_id: String,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub context: Context,
}

impl WriteRequest {
    pub fn new(verb: Verb, kind: &str, remote_id: &str, fields: FieldMap) -> Self {
        Self {
            verb,
            kind: kind.to_string(),
            remote_id: remote_id.to_string(),
            fields,
            context: Context::default(),
        }
    }

    pub fn create(kind: &str, remote_id: &str, fields: FieldMap) -> Self {
        Self::new(Verb::Create, kind, remote_id, fields)
    }

    pub fn update(kind: &str, remote_id: &str, fields: FieldMap) -> Self {
        Self::new(Verb::Update, kind, remote_id, fields)
    }

    pub fn create_or_update(kind: &str, remote_id: &str, fields: FieldMap) -> Self {
        Self::new(Verb::CreateOrUpdate, kind, remote_id, fields)
    }

    pub fn delete(kind: &str, remote_id: &str) -> Self {
        Self::new(Verb::Delete, kind, remote_id, FieldMap::new())
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// Entry point for record operations addressed by remote id.
pub struct Engine<S: Storage = SqliteStorage> {
    config: EngineConfig,
    storage: S,
    handlers: Vec<Box<dyn OperationHandler>>,
    observers: Vec<Box<dyn RecordObserver>>,
}

impl<S: Storage> Engine<S> {
    pub fn new(config: EngineConfig, storage: S) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            handlers: Vec::new(),
            observers: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn add_handler(&mut self, handler: impl OperationHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn add_observer(&mut self, observer: impl RecordObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn create(&mut self, kind: &str, remote_id: &str, fields: FieldMap, context: Context) -> OperationResult {
        self.submit(WriteRequest::create(kind, remote_id, fields).with_context(context))
    }

    pub fn update(&mut self, kind: &str, remote_id: &str, fields: FieldMap, context: Context) -> OperationResult {
        self.submit(WriteRequest::update(kind, remote_id, fields).with_context(context))
    }

    pub fn create_or_update(
        &mut self,
        kind: &str,
        remote_id: &str,
        fields: FieldMap,
        context: Context,
    ) -> OperationResult {
        self.submit(WriteRequest::create_or_update(kind, remote_id, fields).with_context(context))
    }

    pub fn delete(&mut self, kind: &str, remote_id: &str, context: Context) -> OperationResult {
        self.submit(WriteRequest::delete(kind, remote_id).with_context(context))
    }

    /// Runs one request to completion.
    pub fn submit(&mut self, request: WriteRequest) -> OperationResult {
        let WriteRequest {
            verb,
            kind,
            remote_id,
            fields,
            context,
        } = request;

        let representation = match RecordRepresentation::parse(&kind, &remote_id, fields, context.clone()) {
            Ok(representation) => representation,
            Err(err) => {
                return OperationResult::Failed(FailedOperation {
                    request: RequestContext {
                        operation_id: OperationId::new(),
                        verb,
                        kind,
                        remote_id,
                        context,
                    },
                    error: err.into(),
                });
            }
        };

        let mut operation = RecordOperation::new(verb, representation);
        operation.run(Collaborators {
            storage: &mut self.storage,
            config: &self.config,
            handlers: &self.handlers,
            observers: &self.observers,
        })
    }

    /// Runs `requests` in order. Each request gets its own result; a failed
    /// request does not stop the ones after it.
    ///
    /// With `suppress_reference_index_in_batches` set, index upkeep is off
    /// for the run and the index is rebuilt once at the end.
    pub fn apply_batch(
        &mut self,
        requests: impl IntoIterator<Item = WriteRequest>,
    ) -> Result<Vec<OperationResult>, EngineError> {
        let suppress =
            self.config.suppress_reference_index_in_batches && self.storage.reference_index_enabled();
        if suppress {
            self.storage.set_reference_index_enabled(false);
        }

        let results: Vec<OperationResult> = requests.into_iter().map(|r| self.submit(r)).collect();

        if suppress {
            self.storage.set_reference_index_enabled(true);
            let rows = self.storage.rebuild_reference_index()?;
            debug!(rows, "reference index rebuilt after batch");
        }

        let completed = results.iter().filter(|r| r.is_completed()).count();
        let deferred = results.iter().filter(|r| r.is_deferred()).count();
        info!(
            total = results.len(),
            completed,
            deferred,
            failed = results.len() - completed - deferred,
            "batch applied"
        );
        Ok(results)
    }

    /// Lifecycle hook for records deleted outside the engine.
    ///
    /// Drops the record's remote id binding and the pending relations it owns,
    /// but only when the persistence engine confirms the deletion. Returns
    /// whether a mapping was removed.
    pub fn on_record_deleted(&mut self, kind: &EntityKind, native_id: NativeId) -> Result<bool, EngineError> {
        if !self.storage.was_deleted(kind, native_id)? {
            return Ok(false);
        }
        let Some(remote_id) = self.storage.remote_id_for(kind, native_id)? else {
            return Ok(false);
        };

        let scope = format!("unbind_{}", OperationId::new().as_uuid().simple());
        self.storage.begin_scope(&scope)?;
        let outcome = self
            .storage
            .unbind(&remote_id)
            .and_then(|removed| Ok((removed, self.storage.purge_owner(kind, native_id)?)))
            .map_err(EngineError::from);
        let (removed, purged) = operation::finish_scope(&mut self.storage, &scope, outcome)?;
        debug!(remote_id = %remote_id, purged, "binding of deleted record dropped");

        match removed {
            Some(mapping) => {
                for observer in &self.observers {
                    observer.unbound(&mapping);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Adopts a record that already exists in the store under `remote_id`
    /// and completes the relations waiting on it. Both happen atomically.
    pub fn bind_existing(
        &mut self,
        remote_id: &RemoteId,
        kind: &EntityKind,
        native_id: NativeId,
    ) -> Result<Vec<PendingRelation>, EngineError> {
        if self.storage.was_deleted(kind, native_id)? {
            return Err(EngineError::NotFound(format!("{kind}:{native_id}")));
        }
        let record = RecordRef::new(kind.clone(), native_id);
        let scope = format!("bind_{}", OperationId::new().as_uuid().simple());

        self.storage.begin_scope(&scope)?;
        let outcome = self
            .storage
            .bind(remote_id, kind, native_id)
            .map_err(EngineError::from)
            .and_then(|()| relations::resolve_pending(&mut self.storage, remote_id, &record));
        let resolved = operation::finish_scope(&mut self.storage, &scope, outcome)?;

        for observer in &self.observers {
            observer.bound(remote_id, &record);
            for relation in &resolved {
                observer.relation_resolved(relation, &record);
            }
        }
        Ok(resolved)
    }

    /// Relations still waiting on `remote_id`.
    pub fn pending_for(&self, remote_id: &RemoteId) -> Result<Vec<PendingRelation>, EngineError> {
        Ok(self.storage.find_by_target(remote_id)?)
    }
}
