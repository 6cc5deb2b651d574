use remap_core::{FieldMap, NativeId, OperationId, RecordRef, RecordRepresentation, RemoteId};
use remap_storage::{IdentityMapping, PendingRelation};

use crate::message::MessageChannel;
use crate::operation::Verb;

/// The outcome of a `before_persist` hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerDecision {
    /// Proceed to the next handler, then to persistence.
    Continue,
    /// Not possible yet; the operation ends as deferred and nothing is written.
    Stop { reason: String },
    /// The operation must not happen; it ends as failed.
    Abort { reason: String },
}

impl HandlerDecision {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop {
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}

/// What a handler sees of the running operation.
pub struct HandlerContext<'a> {
    pub operation_id: OperationId,
    pub verb: Verb,
    pub representation: &'a RecordRepresentation,
    /// The field changes about to be written. Handlers may edit them before
    /// persistence; edits after persistence have no effect.
    pub payload: &'a mut FieldMap,
    /// Known once the record exists: always for update and delete, after
    /// persistence for create.
    pub native_id: Option<NativeId>,
    pub messages: &'a mut MessageChannel,
}

/// Extension point around the persistence write.
///
/// Handlers run in registration order. A handler that returns anything but
/// `Continue` from `before_persist` ends the chain.
pub trait OperationHandler: Send + Sync {
    fn name(&self) -> &str;

    fn before_persist(&self, _ctx: &mut HandlerContext<'_>) -> HandlerDecision {
        HandlerDecision::Continue
    }

    /// Runs after the write and the identity bookkeeping, inside the same
    /// storage scope. Typically consumes or posts messages.
    fn after_persist(&self, _ctx: &mut HandlerContext<'_>) {}
}

/// Synchronous notifications about identity bookkeeping. Called after the
/// operation's storage scope committed.
pub trait RecordObserver: Send + Sync {
    fn bound(&self, _remote_id: &RemoteId, _record: &RecordRef) {}

    fn unbound(&self, _mapping: &IdentityMapping) {}

    fn relation_resolved(&self, _relation: &PendingRelation, _target: &RecordRef) {}
}
