//! Operation-scoped messages passed between extension points.
//!
//! A [`MessageChannel`] lives exactly as long as one record operation. Each
//! message type gets its own queue. Two disciplines apply per type:
//!
//! - *replacing*: sending drops whatever instance of the same type is still
//!   queued, so at most one is live at a time;
//! - *required*: the operation fails as incomplete if any instance is still
//!   queued when post-processing ends.

use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use remap_core::RemoteId;

pub trait Message: Any + fmt::Debug {
    const REPLACING: bool = false;
    const REQUIRED: bool = false;
}

struct Queue {
    name: &'static str,
    required: bool,
    items: VecDeque<Box<dyn Any>>,
}

#[derive(Default)]
pub struct MessageChannel {
    queues: HashMap<TypeId, Queue>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send<M: Message>(&mut self, message: M) {
        let queue = self.queues.entry(TypeId::of::<M>()).or_insert_with(|| Queue {
            name: type_name::<M>(),
            required: M::REQUIRED,
            items: VecDeque::new(),
        });
        if M::REPLACING {
            queue.items.clear();
        }
        queue.items.push_back(Box::new(message));
    }

    /// Consumes the oldest queued message of type `M`.
    pub fn receive<M: Message>(&mut self) -> Option<M> {
        let queue = self.queues.get_mut(&TypeId::of::<M>())?;
        let item = queue.items.pop_front()?;
        item.downcast::<M>().ok().map(|boxed| *boxed)
    }

    /// Consumes every queued message of type `M`.
    pub fn receive_all<M: Message>(&mut self) -> Vec<M> {
        let mut received = Vec::new();
        while let Some(message) = self.receive::<M>() {
            received.push(message);
        }
        received
    }

    pub fn peek<M: Message>(&self) -> Option<&M> {
        self.queues
            .get(&TypeId::of::<M>())?
            .items
            .front()?
            .downcast_ref::<M>()
    }

    pub fn pending<M: Message>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<M>())
            .map_or(0, |q| q.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.items.is_empty())
    }

    /// Type names of required messages nobody consumed, sorted.
    pub fn unconsumed_required(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.required && !q.items.is_empty())
            .map(|q| q.name.to_string())
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for queue in self.queues.values().filter(|q| !q.items.is_empty()) {
            map.entry(&queue.name, &queue.items.len());
        }
        map.finish()
    }
}

/// Posted during relation resolution when some relation targets were not
/// bound yet and went to the pending-relation ledger instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationsDeferred {
    pub fields: BTreeMap<String, Vec<RemoteId>>,
}

impl Message for RelationsDeferred {
    const REPLACING: bool = true;
}
