//! Broker events
//!
//! Components report what happened through an [`EventSink`] handed to them
//! at construction. Metrics or logging layers subscribe through
//! [`BroadcastEvents`]; tests can collect events directly.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ProtocolVersion, QoS};

/// Why a session left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Clean start replaced it, or it ended with a zero expiry interval
    Clean,
    /// Expiry interval elapsed after disconnect
    Expired,
    /// Retry budget or packet identifiers exhausted
    Failed,
    /// Removed through the status API
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        session_present: bool,
    },
    ClientDisconnected {
        client_id: Arc<str>,
        /// The client sent DISCONNECT before the transport closed
        graceful: bool,
    },
    /// A filter was added to or replaced in a session
    ClientSubscribed {
        client_id: Arc<str>,
        filter: Arc<str>,
        qos: QoS,
    },
    ClientUnsubscribed {
        client_id: Arc<str>,
        filter: Arc<str>,
    },
    MessageEnqueued {
        client_id: Arc<str>,
        topic: Arc<str>,
        qos: QoS,
    },
    /// The bus was full and dropped the incoming message
    MessageDropped {
        client_id: Arc<str>,
        topic: Arc<str>,
    },
    /// The bus was full and evicted its oldest queued message
    MessageOverwritten {
        client_id: Arc<str>,
        topic: Arc<str>,
    },
    /// A publish matched no subscription
    MessageNotConsumed {
        topic: Arc<str>,
        sender: Option<Arc<str>>,
    },
    RetainedChanged {
        topic: Arc<str>,
        removed: bool,
    },
    SessionDeleted {
        client_id: Arc<str>,
        reason: SessionEnd,
    },
}

/// Receives broker events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BrokerEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventSink for NoopEvents {
    fn emit(&self, _event: BrokerEvent) {}
}

/// Fans events out to any number of async subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitting never waits.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<BrokerEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEvents {
    fn emit(&self, event: BrokerEvent) {
        // no receivers is not an error
        let _ = self.tx.send(event);
    }
}
