use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use remap_core::{Context, EntityKind, FieldMap, NativeId, OperationId, RecordRef, RecordRepresentation, RemoteId};
use remap_storage::{IdentityMapping, PendingRelation, Storage, WriteTarget};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handler::{HandlerContext, HandlerDecision, OperationHandler, RecordObserver};
use crate::message::{MessageChannel, RelationsDeferred};
use crate::relations::{self, Placement, RelationLookup};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Create,
    Update,
    CreateOrUpdate,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::CreateOrUpdate => "create_or_update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Validating,
    ResolvingRelations,
    Persisting,
    PostProcessing,
    Completed,
    Failed,
    Deferred,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deferred)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::ResolvingRelations => "resolving_relations",
            Self::Persisting => "persisting",
            Self::PostProcessing => "post_processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }
}

/// A successfully applied operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub operation_id: OperationId,
    /// The verb actually executed; `CreateOrUpdate` settles on one of the two.
    pub verb: Verb,
    pub record: RecordRef,
    pub remote_id: RemoteId,
    /// The payload matched the last imported one and nothing was written.
    pub unchanged: bool,
    /// Relation targets of this record still waiting for their identity.
    pub pending_relations: usize,
    /// Pending relations of other records completed by this operation.
    pub resolved_relations: usize,
}

/// An operation that could not run yet. Nothing was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deferral {
    pub operation_id: OperationId,
    pub reason: String,
    /// The remote id whose arrival would unblock the operation, when known.
    pub waiting_on: Option<RemoteId>,
}

/// The request an outcome belongs to, as submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub operation_id: OperationId,
    pub verb: Verb,
    pub kind: String,
    pub remote_id: String,
    pub context: Context,
}

#[derive(Debug)]
pub struct FailedOperation {
    pub request: RequestContext,
    pub error: EngineError,
}

#[derive(Debug)]
pub enum OperationResult {
    Completed(Completion),
    Deferred(Deferral),
    Failed(FailedOperation),
}

impl OperationResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn completion(&self) -> Option<&Completion> {
        match self {
            Self::Completed(c) => Some(c),
            _ => None,
        }
    }

    pub fn deferral(&self) -> Option<&Deferral> {
        match self {
            Self::Deferred(d) => Some(d),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Self::Failed(f) => Some(&f.error),
            _ => None,
        }
    }
}

/// What an operation borrows from the engine while it runs.
pub struct Collaborators<'a, S: Storage> {
    pub storage: &'a mut S,
    pub config: &'a EngineConfig,
    pub handlers: &'a [Box<dyn OperationHandler>],
    pub observers: &'a [Box<dyn RecordObserver>],
}

enum Step {
    Done(Completion),
    Defer(Deferral),
}

/// Bookkeeping to report to observers once the storage scope committed.
#[derive(Default)]
struct Notices {
    bound: Option<(RemoteId, RecordRef)>,
    unbound: Option<IdentityMapping>,
    resolved: Vec<(PendingRelation, RecordRef)>,
}

/// One create, update, create-or-update or delete of one record.
pub struct RecordOperation {
    id: OperationId,
    requested: Verb,
    verb: Verb,
    representation: RecordRepresentation,
    state: OperationState,
    history: Vec<OperationState>,
    messages: MessageChannel,
}

impl RecordOperation {
    pub fn new(verb: Verb, representation: RecordRepresentation) -> Self {
        Self {
            id: OperationId::new(),
            requested: verb,
            verb,
            representation,
            state: OperationState::Pending,
            history: vec![OperationState::Pending],
            messages: MessageChannel::new(),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Every state the operation passed through, starting with `Pending`.
    pub fn history(&self) -> &[OperationState] {
        &self.history
    }

    pub fn representation(&self) -> &RecordRepresentation {
        &self.representation
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            operation_id: self.id,
            verb: self.requested,
            kind: self.representation.kind().to_string(),
            remote_id: self.representation.remote_id().to_string(),
            context: self.representation.context().clone(),
        }
    }

    fn transition(&mut self, next: OperationState) {
        debug!(from = self.state.as_str(), to = next.as_str(), "operation state");
        self.state = next;
        self.history.push(next);
    }

    /// Runs the operation to a terminal state. Running it twice is a no-op
    /// that reports the operation as failed.
    pub fn run<S: Storage>(&mut self, collab: Collaborators<'_, S>) -> OperationResult {
        let span = info_span!(
            "record_operation",
            op_id = %self.id,
            verb = self.requested.as_str(),
            kind = %self.representation.kind(),
            remote_id = %self.representation.remote_id()
        );
        let _enter = span.enter();

        if self.state != OperationState::Pending {
            return OperationResult::Failed(FailedOperation {
                request: self.request_context(),
                error: EngineError::InvalidArgument("operation already ran".into()),
            });
        }

        match self.execute(collab) {
            Ok(Step::Done(completion)) => {
                self.transition(OperationState::Completed);
                OperationResult::Completed(completion)
            }
            Ok(Step::Defer(deferral)) => {
                info!(reason = %deferral.reason, "operation deferred");
                self.transition(OperationState::Deferred);
                OperationResult::Deferred(deferral)
            }
            Err(error) => {
                debug!(error = %error, "operation failed");
                self.transition(OperationState::Failed);
                OperationResult::Failed(FailedOperation {
                    request: self.request_context(),
                    error,
                })
            }
        }
    }

    fn execute<S: Storage>(&mut self, collab: Collaborators<'_, S>) -> Result<Step, EngineError> {
        let Collaborators {
            storage,
            config,
            handlers,
            observers,
        } = collab;

        self.transition(OperationState::Validating);
        let remote_id = self.representation.remote_id().clone();
        let kind = self.representation.kind().clone();
        let existing = storage.mapping(&remote_id)?;

        self.verb = match (self.requested, &existing) {
            (Verb::CreateOrUpdate, Some(_)) => Verb::Update,
            (Verb::CreateOrUpdate, None) => Verb::Create,
            (verb, _) => verb,
        };

        let existing = match (self.verb, existing) {
            (Verb::Create, Some(mapping)) => {
                return Err(EngineError::IdentityConflict(format!(
                    "remote id {remote_id} is already bound to {}",
                    mapping.record_ref()
                )));
            }
            (Verb::Create, None) => None,
            (_, None) => return Err(EngineError::NotFound(format!("remote id {remote_id}"))),
            (_, Some(mapping)) if mapping.kind != kind => {
                return Err(EngineError::IdentityConflict(format!(
                    "remote id {remote_id} is bound to {}, not to kind {kind}",
                    mapping.record_ref()
                )));
            }
            (_, Some(mapping)) => Some(mapping),
        };

        let mut notices = Notices::default();
        let step = match (self.verb, existing) {
            (Verb::Delete, Some(mapping)) => {
                self.delete(storage, handlers, mapping, &mut notices)?
            }
            (_, existing) => self.write(storage, config, handlers, existing, &mut notices)?,
        };

        notify(observers, notices);

        // Only an operation that went through post-processing owes its
        // required messages a consumer.
        if self.state == OperationState::PostProcessing {
            let unconsumed = self.messages.unconsumed_required();
            if !unconsumed.is_empty() {
                warn!(messages = ?unconsumed, "required messages left unconsumed, write kept");
                return Err(EngineError::Incomplete(unconsumed));
            }
        }
        Ok(step)
    }

    fn write<S: Storage>(
        &mut self,
        storage: &mut S,
        config: &EngineConfig,
        handlers: &[Box<dyn OperationHandler>],
        existing: Option<IdentityMapping>,
        notices: &mut Notices,
    ) -> Result<Step, EngineError> {
        let remote_id = self.representation.remote_id().clone();
        let kind = self.representation.kind().clone();
        let fingerprint = self.representation.fingerprint()?;

        if let Some(mapping) = &existing
            && config.skip_unchanged
            && mapping.fingerprint == Some(fingerprint)
        {
            debug!("payload unchanged since last import, skipping write");
            storage.touch(&remote_id)?;
            return Ok(Step::Done(self.completion(mapping.record_ref(), true, 0, 0)));
        }

        self.transition(OperationState::ResolvingRelations);
        let mut payload = self.representation.fields().clone();
        let target = match &existing {
            Some(mapping) => {
                payload.remove(&config.location_field);
                WriteTarget::Existing(mapping.native_id)
            }
            None => match relations::resolve_location(&*storage, config, &kind, &mut payload)? {
                Placement::At(location) => WriteTarget::New { location },
                Placement::WaitingOn(parent) => {
                    return Ok(Step::Defer(Deferral {
                        operation_id: self.id,
                        reason: format!("parent {parent} is not imported yet"),
                        waiting_on: Some(parent),
                    }));
                }
            },
        };
        let lookup = relations::resolve_relations(&*storage, config, &kind, &mut payload)?;

        let native_id = existing.as_ref().map(|m| m.native_id);
        if let Some(deferral) = self.before_persist(handlers, &mut payload, native_id)? {
            return Ok(Step::Defer(deferral));
        }

        self.transition(OperationState::Persisting);
        let scope = self.scope_name();
        storage.begin_scope(&scope)?;
        let persisted = self.persist(storage, handlers, &kind, target, payload, &lookup, fingerprint, notices);
        let (record, pending) = finish_scope(storage, &scope, persisted)?;

        Ok(Step::Done(self.completion(
            record,
            false,
            pending,
            notices.resolved.len(),
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn persist<S: Storage>(
        &mut self,
        storage: &mut S,
        handlers: &[Box<dyn OperationHandler>],
        kind: &EntityKind,
        target: WriteTarget,
        mut payload: FieldMap,
        lookup: &RelationLookup,
        fingerprint: [u8; 32],
        notices: &mut Notices,
    ) -> Result<(RecordRef, usize), EngineError> {
        let remote_id = self.representation.remote_id().clone();
        let context = self.representation.context().clone();

        let native_id = storage.apply_field_changes(kind, target, &payload, &context)?;
        let record = RecordRef::new(kind.clone(), native_id);

        if matches!(target, WriteTarget::New { .. }) {
            storage.bind(&remote_id, kind, native_id)?;
            notices.bound = Some((remote_id.clone(), record.clone()));
        }

        relations::register_pending(storage, kind, native_id, lookup)?;

        // The write lock is held from here on, so targets another writer
        // bound since the lookup are visible and get completed now.
        for (relation, late_target) in relations::resolve_late_bound(storage, lookup)? {
            notices.resolved.push((relation, late_target));
        }

        if matches!(target, WriteTarget::New { .. }) {
            for relation in relations::resolve_pending(storage, &remote_id, &record)? {
                notices.resolved.push((relation, record.clone()));
            }
        }
        storage.set_fingerprint(&remote_id, &fingerprint)?;

        // Read back after resolving, self references are already complete.
        let mut waiting = BTreeMap::new();
        for field in lookup.slots.keys() {
            let targets: Vec<RemoteId> = storage
                .find_by_slot(kind, field, native_id)?
                .into_iter()
                .map(|p| p.target)
                .collect();
            if !targets.is_empty() {
                waiting.insert(field.clone(), targets);
            }
        }
        let pending = waiting.values().map(Vec::len).sum();
        if !waiting.is_empty() {
            self.messages.send(RelationsDeferred { fields: waiting });
        }

        self.transition(OperationState::PostProcessing);
        self.after_persist(handlers, &mut payload, native_id);
        Ok((record, pending))
    }

    fn delete<S: Storage>(
        &mut self,
        storage: &mut S,
        handlers: &[Box<dyn OperationHandler>],
        mapping: IdentityMapping,
        notices: &mut Notices,
    ) -> Result<Step, EngineError> {
        let mut payload = FieldMap::new();
        if let Some(deferral) = self.before_persist(handlers, &mut payload, Some(mapping.native_id))? {
            return Ok(Step::Defer(deferral));
        }

        self.transition(OperationState::Persisting);
        let scope = self.scope_name();
        storage.begin_scope(&scope)?;
        let removed = self.remove(storage, handlers, &mapping, &mut payload);
        let record = finish_scope(storage, &scope, removed)?;
        notices.unbound = Some(mapping);

        Ok(Step::Done(self.completion(record, false, 0, 0)))
    }

    fn remove<S: Storage>(
        &mut self,
        storage: &mut S,
        handlers: &[Box<dyn OperationHandler>],
        mapping: &IdentityMapping,
        payload: &mut FieldMap,
    ) -> Result<RecordRef, EngineError> {
        storage.delete_record(&mapping.kind, mapping.native_id)?;
        storage.unbind(&mapping.remote_id)?;
        let purged = storage.purge_owner(&mapping.kind, mapping.native_id)?;
        if purged > 0 {
            debug!(purged, "pending relations of deleted record purged");
        }

        self.transition(OperationState::PostProcessing);
        self.after_persist(handlers, payload, mapping.native_id);
        Ok(mapping.record_ref())
    }

    fn before_persist(
        &mut self,
        handlers: &[Box<dyn OperationHandler>],
        payload: &mut FieldMap,
        native_id: Option<NativeId>,
    ) -> Result<Option<Deferral>, EngineError> {
        for handler in handlers {
            let mut ctx = HandlerContext {
                operation_id: self.id,
                verb: self.verb,
                representation: &self.representation,
                payload: &mut *payload,
                native_id,
                messages: &mut self.messages,
            };
            match handler.before_persist(&mut ctx) {
                HandlerDecision::Continue => {}
                HandlerDecision::Stop { reason } => {
                    return Ok(Some(Deferral {
                        operation_id: self.id,
                        reason: format!("{}: {reason}", handler.name()),
                        waiting_on: None,
                    }));
                }
                HandlerDecision::Abort { reason } => {
                    info!(handler = handler.name(), reason = %reason, "operation aborted by handler");
                    return Err(EngineError::Aborted {
                        handler: handler.name().to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(None)
    }

    fn after_persist(
        &mut self,
        handlers: &[Box<dyn OperationHandler>],
        payload: &mut FieldMap,
        native_id: NativeId,
    ) {
        for handler in handlers {
            let mut ctx = HandlerContext {
                operation_id: self.id,
                verb: self.verb,
                representation: &self.representation,
                payload: &mut *payload,
                native_id: Some(native_id),
                messages: &mut self.messages,
            };
            handler.after_persist(&mut ctx);
        }
    }

    fn scope_name(&self) -> String {
        format!("op_{}", self.id.as_uuid().simple())
    }

    fn completion(
        &self,
        record: RecordRef,
        unchanged: bool,
        pending_relations: usize,
        resolved_relations: usize,
    ) -> Completion {
        Completion {
            operation_id: self.id,
            verb: self.verb,
            record,
            remote_id: self.representation.remote_id().clone(),
            unchanged,
            pending_relations,
            resolved_relations,
        }
    }
}

/// Commits the scope on success, rolls it back on failure.
pub(crate) fn finish_scope<S: Storage, T>(
    storage: &mut S,
    scope: &str,
    outcome: Result<T, EngineError>,
) -> Result<T, EngineError> {
    match outcome {
        Ok(value) => {
            storage.commit_scope(scope)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = storage.rollback_scope(scope) {
                warn!(error = %rollback, "rollback after failed operation also failed");
            }
            Err(err)
        }
    }
}

fn notify(observers: &[Box<dyn RecordObserver>], notices: Notices) {
    if let Some((remote_id, record)) = &notices.bound {
        for observer in observers {
            observer.bound(remote_id, record);
        }
    }
    if let Some(mapping) = &notices.unbound {
        for observer in observers {
            observer.unbound(mapping);
        }
    }
    for (relation, target) in &notices.resolved {
        for observer in observers {
            observer.relation_resolved(relation, target);
        }
    }
}
