//! Packet identifier arena for QoS 1/2 handshakes
//!
//! Outbound entries are keyed by packet id and tagged with the response the
//! broker is waiting for, so correlating an acknowledgement is one lookup and
//! a tag comparison. Inbound QoS 2 ids are tracked separately until PUBREL.

use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};

use crate::protocol::{Ack, Packet, ProtocolError, Publish};

/// Response expected for an outbound entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitedAck {
    /// QoS 1 PUBLISH sent
    PubAck,
    /// QoS 2 PUBLISH sent
    PubRec,
    /// PUBREL sent
    PubComp,
}

#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub publish: Publish,
    pub awaiting: AwaitedAck,
    /// `None` while the packet sits in the bus
    pub sent_at: Option<Instant>,
    pub retries: u32,
}

/// Result of matching an acknowledgement against the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMatch {
    /// Entry found in the expected state and advanced or removed
    Matched,
    /// No entry with this id
    Unknown,
    /// Entry exists but awaits a different response
    WrongState(AwaitedAck),
}

#[derive(Debug)]
pub struct InflightTable {
    outbound: AHashMap<u16, InflightEntry>,
    inbound: AHashSet<u16>,
    next_id: u16,
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightTable {
    pub fn new() -> Self {
        Self {
            outbound: AHashMap::new(),
            inbound: AHashSet::new(),
            next_id: 1,
        }
    }

    /// Next free identifier from the rolling counter, skipping ids held in
    /// either direction
    pub fn allocate(&mut self) -> Result<u16, ProtocolError> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.outbound.contains_key(&id) && !self.inbound.contains(&id) {
                return Ok(id);
            }
        }
        Err(ProtocolError::session_failure(
            "packet identifier space exhausted",
        ))
    }

    /// Register a queued outbound publish under its id
    pub fn insert(&mut self, publish: Publish, awaiting: AwaitedAck) -> Option<u16> {
        let id = publish.packet_id?;
        self.outbound.insert(
            id,
            InflightEntry {
                publish,
                awaiting,
                sent_at: None,
                retries: 0,
            },
        );
        Some(id)
    }

    /// Restore an entry as-is (session resume from storage)
    pub fn restore(&mut self, id: u16, entry: InflightEntry) {
        self.outbound.insert(id, entry);
    }

    /// Start the ack timer for the packet just written
    pub fn mark_sent(&mut self, id: u16, now: Instant) {
        if let Some(entry) = self.outbound.get_mut(&id) {
            entry.sent_at = Some(now);
        }
    }

    pub fn release(&mut self, id: u16) -> Option<InflightEntry> {
        self.outbound.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&InflightEntry> {
        self.outbound.get(&id)
    }

    /// PUBACK or PUBCOMP: both end the handshake
    pub fn complete(&mut self, id: u16, expected: AwaitedAck) -> AckMatch {
        match self.outbound.get(&id) {
            None => AckMatch::Unknown,
            Some(entry) if entry.awaiting != expected => AckMatch::WrongState(entry.awaiting),
            Some(_) => {
                self.outbound.remove(&id);
                AckMatch::Matched
            }
        }
    }

    /// PUBREC: switch the entry to wait for PUBCOMP. The PUBREL goes out
    /// separately, so the timer stops until it is written.
    pub fn received(&mut self, id: u16) -> AckMatch {
        match self.outbound.get_mut(&id) {
            None => AckMatch::Unknown,
            Some(entry) => match entry.awaiting {
                AwaitedAck::PubRec | AwaitedAck::PubComp => {
                    entry.awaiting = AwaitedAck::PubComp;
                    entry.sent_at = None;
                    AckMatch::Matched
                }
                other => AckMatch::WrongState(other),
            },
        }
    }

    /// Entries whose ack wait has expired, as the packets to resend.
    ///
    /// Each resend counts against `max_retries`; an entry already at the cap
    /// fails the whole session.
    pub fn due(
        &mut self,
        now: Instant,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Vec<Packet>, ProtocolError> {
        let mut resend = Vec::new();
        let mut ids: Vec<u16> = self
            .outbound
            .iter()
            .filter(|(_, e)| e.sent_at.is_some_and(|t| now.saturating_duration_since(t) >= timeout))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();

        for id in ids {
            let Some(entry) = self.outbound.get_mut(&id) else {
                continue;
            };
            if entry.retries >= max_retries {
                return Err(ProtocolError::session_failure(format!(
                    "no acknowledgement for packet {} after {} retries",
                    id, entry.retries
                )));
            }
            entry.retries += 1;
            entry.sent_at = None;
            resend.push(match entry.awaiting {
                AwaitedAck::PubAck | AwaitedAck::PubRec => {
                    let mut publish = entry.publish.clone();
                    publish.dup = true;
                    Packet::Publish(publish)
                }
                AwaitedAck::PubComp => Packet::PubRel(Ack::new(id)),
            });
        }
        Ok(resend)
    }

    /// Everything still awaiting a response, for replay on reconnect.
    /// Ids in `queued` are still on the bus and are skipped. Publishes are
    /// flagged Dup.
    pub fn replay(&mut self, queued: &AHashSet<u16>) -> Vec<Packet> {
        let mut ids: Vec<u16> = self
            .outbound
            .keys()
            .copied()
            .filter(|id| !queued.contains(id))
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.outbound.get_mut(&id)?;
                entry.sent_at = None;
                Some(match entry.awaiting {
                    AwaitedAck::PubComp => Packet::PubRel(Ack::new(id)),
                    _ => {
                        let mut publish = entry.publish.clone();
                        publish.dup = true;
                        Packet::Publish(publish)
                    }
                })
            })
            .collect()
    }

    /// Record an inbound QoS 2 id. Returns `false` for a duplicate.
    pub fn track_inbound(&mut self, id: u16) -> bool {
        self.inbound.insert(id)
    }

    /// Clear an inbound id on PUBREL. Returns whether it was tracked.
    pub fn release_inbound(&mut self, id: u16) -> bool {
        self.inbound.remove(&id)
    }

    pub fn inbound_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.inbound.iter().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, &InflightEntry)> + '_ {
        self.outbound.iter().map(|(id, e)| (*id, e))
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}
