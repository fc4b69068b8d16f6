//! Client sessions
//!
//! A session outlives its connections. It owns the outbound packet bus, the
//! packet identifier arena and the subscription set, and is shared between
//! the owning connection and the dispatcher. The bus and the arena each have
//! their own lock, so enqueueing from another session's publish never
//! contends with the owner's state.

mod bus;
mod inflight;
mod store;

#[cfg(test)]
mod tests;

pub use bus::{
    BusItem, Completion, DeliveryReceipt, Enqueued, Overflow, OverflowStrategy, PacketBus,
    Partition,
};
pub use inflight::{AckMatch, AwaitedAck, InflightEntry, InflightTable};
pub use store::SessionStore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::events::{BrokerEvent, EventSink};
use crate::protocol::{
    Ack, Packet, ProtocolError, ProtocolVersion, Publish, QoS, ReasonCode, Will,
};
use crate::topic::Subscription;

/// Session expiry interval meaning "never"
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Per-session limits fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_pending_messages: usize,
    pub overflow_strategy: OverflowStrategy,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pending_messages: 1000,
            overflow_strategy: OverflowStrategy::DropNewMessage,
        }
    }
}

/// Mutable session fields guarded by one lock
#[derive(Debug)]
pub struct SessionState {
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    /// Seconds after disconnect before removal; [`EXPIRY_NEVER`] keeps it
    pub expiry_interval: u32,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
    pub subscriptions: AHashMap<Arc<str>, Subscription>,
    items: AHashMap<String, Bytes>,
}

pub struct Session {
    id: Arc<str>,
    created_at: Instant,
    bus: PacketBus,
    inflight: Mutex<InflightTable>,
    state: RwLock<SessionState>,
    events: Arc<dyn EventSink>,
}

impl Session {
    pub fn new(
        id: impl Into<Arc<str>>,
        protocol_version: ProtocolVersion,
        limits: SessionLimits,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Instant::now(),
            bus: PacketBus::new(limits.max_pending_messages, limits.overflow_strategy),
            inflight: Mutex::new(InflightTable::new()),
            state: RwLock::new(SessionState {
                protocol_version,
                clean_start: true,
                expiry_interval: 0,
                keep_alive: 0,
                will: None,
                connected: false,
                disconnected_at: None,
                subscriptions: AHashMap::new(),
                items: AHashMap::new(),
            }),
            events,
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn bus(&self) -> &PacketBus {
        &self.bus
    }

    pub fn state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write()
    }

    pub fn inflight(&self) -> parking_lot::MutexGuard<'_, InflightTable> {
        self.inflight.lock()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.state.read().protocol_version
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Queue an application message at the QoS it will be delivered with.
    ///
    /// QoS 1/2 messages get a packet id and an inflight entry now, so the
    /// handshake state exists before the writer sees the packet. If the bus
    /// rejects or evicts a message, its packet id is released at once.
    pub fn enqueue_publish(&self, mut publish: Publish) -> Result<DeliveryReceipt, ProtocolError> {
        publish.dup = false;
        let topic = publish.topic.clone();
        let qos = publish.qos;

        let enqueued = if qos.needs_packet_id() {
            let mut inflight = self.inflight.lock();
            let id = inflight.allocate()?;
            publish.packet_id = Some(id);
            let awaiting = match qos {
                QoS::ExactlyOnce => AwaitedAck::PubRec,
                _ => AwaitedAck::PubAck,
            };
            inflight.insert(publish.clone(), awaiting);
            let enqueued = self.bus.enqueue(Packet::Publish(publish), Partition::Data);
            if let Some(Overflow::DroppedNew(_)) = enqueued.overflow {
                inflight.release(id);
            }
            enqueued
        } else {
            publish.packet_id = None;
            self.bus.enqueue(Packet::Publish(publish), Partition::Data)
        };

        // an evicted QoS 1/2 message was never sent, whatever displaced it
        if let Some(Overflow::Overwritten(Packet::Publish(ref evicted))) = enqueued.overflow {
            if let Some(evicted_id) = evicted.packet_id {
                self.inflight.lock().release(evicted_id);
            }
        }

        match enqueued.overflow {
            None => {
                trace!(client_id = %self.id, topic = %topic, ?qos, "message enqueued");
                self.events.emit(BrokerEvent::MessageEnqueued {
                    client_id: self.id.clone(),
                    topic,
                    qos,
                });
            }
            Some(Overflow::DroppedNew(_)) => {
                debug!(client_id = %self.id, topic = %topic, "queue full, message dropped");
                self.events.emit(BrokerEvent::MessageDropped {
                    client_id: self.id.clone(),
                    topic,
                });
            }
            Some(Overflow::Overwritten(evicted)) => {
                let evicted_topic = match evicted {
                    Packet::Publish(p) => p.topic,
                    _ => topic.clone(),
                };
                debug!(client_id = %self.id, topic = %evicted_topic, "queue full, oldest message overwritten");
                self.events.emit(BrokerEvent::MessageOverwritten {
                    client_id: self.id.clone(),
                    topic: evicted_topic,
                });
                self.events.emit(BrokerEvent::MessageEnqueued {
                    client_id: self.id.clone(),
                    topic,
                    qos,
                });
            }
        }
        Ok(enqueued.receipt)
    }

    /// Acknowledgements, PUBREL and retransmissions. Never dropped on overflow.
    pub fn enqueue_control(&self, packet: Packet) -> DeliveryReceipt {
        self.bus.enqueue(packet, Partition::Control).receipt
    }

    pub fn enqueue_health(&self, packet: Packet) -> DeliveryReceipt {
        self.bus.enqueue(packet, Partition::Health).receipt
    }

    /// Start ack timers for a packet the writer just flushed
    pub fn on_packet_written(&self, packet: &Packet, now: Instant) {
        let id = match packet {
            Packet::Publish(p) => p.packet_id,
            Packet::PubRel(ack) => Some(ack.packet_id),
            _ => None,
        };
        if let Some(id) = id {
            self.inflight.lock().mark_sent(id, now);
        }
    }

    pub fn on_puback(&self, id: u16) -> AckMatch {
        self.inflight.lock().complete(id, AwaitedAck::PubAck)
    }

    /// Handle PUBREC and return the PUBREL to send.
    ///
    /// An error reason code ends the exchange and fails the session.
    pub fn on_pubrec(&self, id: u16, reason: ReasonCode) -> Result<Ack, ProtocolError> {
        let mut inflight = self.inflight.lock();
        if reason.is_error() {
            inflight.release(id);
            return Err(ProtocolError::session_failure(format!(
                "PUBREC for packet {} failed: {}",
                id, reason
            )));
        }
        match inflight.received(id) {
            AckMatch::Matched => Ok(Ack::new(id)),
            AckMatch::Unknown | AckMatch::WrongState(_) => Ok(self.not_found(id)),
        }
    }

    pub fn on_pubcomp(&self, id: u16) -> AckMatch {
        self.inflight.lock().complete(id, AwaitedAck::PubComp)
    }

    /// Record an inbound QoS 2 publish. `false` means it is a retransmission
    /// that must be acknowledged but not delivered again.
    pub fn on_inbound_qos2(&self, id: u16) -> bool {
        self.inflight.lock().track_inbound(id)
    }

    /// Handle PUBREL and return the PUBCOMP to send
    pub fn on_pubrel(&self, id: u16) -> Ack {
        if self.inflight.lock().release_inbound(id) {
            Ack::new(id)
        } else {
            self.not_found(id)
        }
    }

    fn not_found(&self, id: u16) -> Ack {
        if self.protocol_version().is_v5() {
            Ack::with_reason(id, ReasonCode::PacketIdNotFound)
        } else {
            Ack::new(id)
        }
    }

    /// Re-queue every handshake whose ack wait expired. Returns how many
    /// packets were queued, or a session failure once an entry runs out of
    /// retries.
    pub fn retry_expired(
        &self,
        now: Instant,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<usize, ProtocolError> {
        let packets = self.inflight.lock().due(now, timeout, max_retries)?;
        let count = packets.len();
        for packet in packets {
            debug!(client_id = %self.id, packet_id = ?packet.packet_id(), "retransmitting");
            self.enqueue_control(packet);
        }
        Ok(count)
    }

    /// Resend unacknowledged handshakes after a reconnect. Publishes still
    /// waiting in the data partition go out in their turn instead.
    pub fn replay_inflight(&self) -> usize {
        let queued: AHashSet<u16> = self
            .bus
            .pending_data()
            .iter()
            .filter_map(Packet::packet_id)
            .collect();
        let packets = self.inflight.lock().replay(&queued);
        let count = packets.len();
        for packet in packets {
            self.enqueue_control(packet);
        }
        count
    }

    pub fn mark_connected(&self) {
        let mut state = self.state.write();
        state.connected = true;
        state.disconnected_at = None;
    }

    pub fn mark_disconnected(&self, now: Instant) {
        let mut state = self.state.write();
        state.connected = false;
        state.disconnected_at = Some(now);
    }

    /// Disconnected for at least the expiry interval
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state.read();
        if state.connected {
            return false;
        }
        match (state.expiry_interval, state.disconnected_at) {
            (0, _) => true,
            (EXPIRY_NEVER, _) => false,
            (secs, Some(at)) => now.saturating_duration_since(at) >= Duration::from_secs(secs.into()),
            (_, None) => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.bus.data_len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().outbound_len()
    }

    pub fn set_item(&self, key: impl Into<String>, value: Bytes) -> Option<Bytes> {
        self.state.write().items.insert(key.into(), value)
    }

    pub fn item(&self, key: &str) -> Option<Bytes> {
        self.state.read().items.get(key).cloned()
    }

    pub fn remove_item(&self, key: &str) -> Option<Bytes> {
        self.state.write().items.remove(key)
    }

    /// Drop the per-connection packets (acks, pings, retransmissions) when
    /// the connection goes away. Queued application messages stay.
    pub fn detach(&self) -> usize {
        self.bus.clear(Partition::Control).len() + self.bus.clear(Partition::Health).len()
    }

    /// Abandon everything queued and stop accepting packets
    pub fn close(&self) {
        self.bus.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}
