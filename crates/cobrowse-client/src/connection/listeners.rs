//! Typed listener registry for connection events.
//!
//! Handlers run synchronously on the read loop, in registration order.
//! The registry lock is released before any handler is called, so a handler
//! may register or remove listeners (including itself).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use cobrowse_core::errors::TerminalReconnectError;
use cobrowse_core::ids::SessionId;
use cobrowse_core::protocol::{InboundKind, InboundMessage};
use cobrowse_core::session::ConnectionState;

/// Something observable on the shared connection.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A well-formed inbound message of a consumed kind.
    Message(Arc<InboundMessage>),
    /// Every inbound frame that parsed as JSON, before typed decoding.
    Raw(Arc<Value>),
    /// The transport closed.
    Closed {
        /// Neither requested by `disconnect` nor a normal close from the peer.
        abnormal: bool,
        /// Close reason, if any.
        reason: Option<String>,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnect attempts were exhausted; the manager is offline.
    ReconnectExhausted(TerminalReconnectError),
}

/// Which events a listener receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Lifecycle events: state changes, closes, reconnect scheduling.
    State,
    /// Messages of one kind.
    Kind(InboundKind),
    /// Messages concerning one session.
    Session(SessionId),
    /// Every typed message.
    Messages,
    /// Every raw frame.
    Raw,
    /// Everything.
    All,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &ConnectionEvent) -> bool {
        match (self, event) {
            (Self::All, _)
            | (
                Self::State,
                ConnectionEvent::StateChanged(_)
                | ConnectionEvent::Closed { .. }
                | ConnectionEvent::ReconnectScheduled { .. }
                | ConnectionEvent::ReconnectExhausted(_),
            )
            | (Self::Messages, ConnectionEvent::Message(_))
            | (Self::Raw, ConnectionEvent::Raw(_)) => true,
            (Self::Kind(kind), ConnectionEvent::Message(msg)) => msg.kind() == *kind,
            (Self::Session(id), ConnectionEvent::Message(msg)) => msg.session_id() == Some(id),
            _ => false,
        }
    }
}

/// Handle returned by `on`, used to remove the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A connection event handler.
pub type Handler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct Entry {
    id: ListenerId,
    filter: EventFilter,
    handler: Handler,
}

/// Filtered listener list.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, filter: EventFilter, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Entry {
            id,
            filter,
            handler,
        });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub(crate) fn emit(&self, event: &ConnectionEvent) {
        let matching: Vec<Handler> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.filter.matches(event))
            .map(|e| Arc::clone(&e.handler))
            .collect();
        for handler in matching {
            handler(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
