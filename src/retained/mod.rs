//! Retained message store
//!
//! One entry per topic name. The store is read on every new subscription
//! and written by retained publishes, so it sits behind a reader-writer lock
//! like the subscription index.


use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::protocol::{ProtocolError, Properties, Publish, QoS};
use crate::session::Session;
use crate::topic::{topic_matches_filter, TopicHash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub stored_at: Instant,
    topic_hash: u64,
}

impl RetainedMessage {
    pub fn new(
        topic: impl Into<Arc<str>>,
        payload: Bytes,
        qos: QoS,
        properties: Properties,
        stored_at: Instant,
    ) -> Self {
        let topic = topic.into();
        Self {
            topic_hash: TopicHash::calculate(&topic).hash,
            topic,
            payload,
            qos,
            properties,
            stored_at,
        }
    }

    pub fn from_publish(publish: &Publish, now: Instant) -> Self {
        let mut properties = publish.properties.clone();
        // per-delivery values never belong to the stored copy
        properties.subscription_identifiers.clear();
        properties.topic_alias = None;
        Self::new(
            publish.topic.clone(),
            publish.payload.clone(),
            publish.qos,
            properties,
            now,
        )
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.properties
            .message_expiry_interval
            .map(|secs| self.stored_at + Duration::from_secs(secs.into()))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Build the PUBLISH replayed to a subscriber. The retain flag is set
    /// and any expiry interval is reduced by the time already spent stored.
    pub fn to_publish(&self, qos: QoS, now: Instant) -> Publish {
        let mut properties = self.properties.clone();
        if let Some(at) = self.expires_at() {
            let remaining = at.saturating_duration_since(now).as_secs();
            properties.message_expiry_interval = Some(remaining.max(1) as u32);
        }
        Publish {
            dup: false,
            qos: self.qos.min(qos),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties,
        }
    }

    fn same_content(&self, other: &Self) -> bool {
        self.payload == other.payload && self.qos == other.qos && self.properties == other.properties
    }
}

/// Effect of a retained publish on the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedChange {
    Stored,
    Replaced,
    Removed,
    /// Nothing to delete, or identical content already stored
    Unchanged,
}

#[derive(Default)]
pub struct RetainedStore {
    messages: RwLock<AHashMap<Arc<str>, RetainedMessage>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish: an empty payload deletes the topic's entry,
    /// anything else overwrites it
    pub fn update(&self, publish: &Publish, now: Instant) -> RetainedChange {
        if publish.payload.is_empty() {
            return match self.messages.write().remove(&publish.topic) {
                Some(_) => RetainedChange::Removed,
                None => RetainedChange::Unchanged,
            };
        }
        self.insert(RetainedMessage::from_publish(publish, now))
    }

    /// Store a message as-is (restore from storage)
    pub fn insert(&self, message: RetainedMessage) -> RetainedChange {
        let mut messages = self.messages.write();
        match messages.get(&message.topic) {
            Some(existing) if existing.same_content(&message) => RetainedChange::Unchanged,
            Some(_) => {
                messages.insert(message.topic.clone(), message);
                RetainedChange::Replaced
            }
            None => {
                messages.insert(message.topic.clone(), message);
                RetainedChange::Stored
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.read().get(topic).cloned()
    }

    pub fn remove(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.write().remove(topic)
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&self) -> usize {
        let mut messages = self.messages.write();
        let count = messages.len();
        messages.clear();
        count
    }

    /// Live messages whose topic matches `filter`, in topic order.
    /// Expired entries found along the way are purged.
    pub fn matching(&self, filter: &str, now: Instant) -> Vec<RetainedMessage> {
        let filter_hash = TopicHash::calculate(filter);
        let mut found = Vec::new();
        let mut expired = Vec::new();
        {
            let messages = self.messages.read();
            for message in messages.values() {
                if !filter_hash.may_match(message.topic_hash) {
                    continue;
                }
                let matched = if filter_hash.has_wildcard {
                    topic_matches_filter(&message.topic, filter)
                } else {
                    *message.topic == *filter
                };
                if !matched {
                    continue;
                }
                if message.is_expired(now) {
                    expired.push(message.topic.clone());
                } else {
                    found.push(message.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut messages = self.messages.write();
            for topic in &expired {
                if messages.get(topic).is_some_and(|m| m.is_expired(now)) {
                    messages.remove(topic);
                }
            }
        }
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    /// Queue every retained message matching `filter` onto the session's
    /// bus, capped at `granted` QoS. Called while handling the SUBSCRIBE, so
    /// replay is queued ahead of any live publish processed after it.
    pub fn replay_to(
        &self,
        session: &Session,
        filter: &str,
        granted: QoS,
        subscription_id: Option<u32>,
        now: Instant,
    ) -> Result<usize, ProtocolError> {
        let messages = self.matching(filter, now);
        for message in &messages {
            let mut publish = message.to_publish(granted, now);
            if let Some(id) = subscription_id {
                publish.properties.subscription_identifiers.push(id);
            }
            trace!(client_id = %session.id(), topic = %message.topic, "replaying retained message");
            session.enqueue_publish(publish)?;
        }
        Ok(messages.len())
    }

    /// Purge expired entries, returning the removed topics
    pub fn purge_expired(&self, now: Instant) -> Vec<Arc<str>> {
        let mut messages = self.messages.write();
        let expired: Vec<Arc<str>> = messages
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.topic.clone())
            .collect();
        for topic in &expired {
            messages.remove(topic);
        }
        expired
    }

    pub fn snapshot(&self) -> Vec<RetainedMessage> {
        let mut all: Vec<RetainedMessage> = self.messages.read().values().cloned().collect();
        all.sort_by(|a, b| a.topic.cmp(&b.topic));
        all
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}
