//! Typed publish/subscribe for replica state transitions
//!
//! Subscribers register a callback per event kind and receive events
//! synchronously, right after the causing transition has been applied.
//! Subscriptions are explicit and can be dropped with `unsubscribe`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cluster::{ClusterConfig, MemberId};
use crate::core::replica::Role;

/// An observable replica event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A replica won an election for the given term.
    LeaderElected { term: u64, leader: MemberId },
    /// A replica changed role.
    StateChanged { member: MemberId, role: Role },
    /// A committed command was applied to the state machine.
    CommandApplied { index: u64, name: String },
    /// A committed configuration entry took effect.
    MembershipChanged { config: ClusterConfig },
    /// A snapshot was installed, replacing the log prefix it covers.
    SnapshotInstalled { last_included_index: u64, last_included_term: u64 },
}

/// Event kinds, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LeaderElected,
    StateChanged,
    CommandApplied,
    MembershipChanged,
    SnapshotInstalled,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::LeaderElected { .. } => EventKind::LeaderElected,
            Event::StateChanged { .. } => EventKind::StateChanged,
            Event::CommandApplied { .. } => EventKind::CommandApplied,
            Event::MembershipChanged { .. } => EventKind::MembershipChanged,
            Event::SnapshotInstalled { .. } => EventKind::SnapshotInstalled,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Callback)>>,
}

/// Registry of event subscribers. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register a callback for one event kind. Callbacks run synchronously
    /// on the emitting path and must not block.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));
        Subscription { kind, id }
    }

    /// Remove a previously registered callback. Unknown subscriptions are
    /// ignored.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(handlers) = registry.handlers.get_mut(&subscription.kind) {
            handlers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Dispatch an event to every subscriber of its kind, in subscription
    /// order.
    pub fn emit(&self, event: &Event) {
        let registry = self.registry.lock().unwrap();
        if let Some(handlers) = registry.handlers.get(&event.kind()) {
            for (_, handler) in handlers {
                handler(event);
            }
        }
    }
}
