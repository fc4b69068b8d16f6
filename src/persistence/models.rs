//! Storage-friendly copies of runtime types.
//!
//! Everything here is plain owned data encoded with bincode. Monotonic
//! `Instant`s are stored as approximate unix seconds and mapped back on load.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashSet;
use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::{PersistenceError, Result};
use crate::events::EventSink;
use crate::protocol::{
    Packet, Properties, ProtocolVersion, Publish, QoS, RetainHandling, SubscriptionOptions, Will,
};
use crate::retained::RetainedMessage;
use crate::session::{AwaitedAck, InflightEntry, Session, SessionLimits};
use crate::topic::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub properties: StoredProperties,
    pub stored_at_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub protocol_version: u8,
    pub expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    pub will: Option<StoredWill>,
    /// Queued but never written, oldest first
    pub pending: Vec<StoredPublish>,
    pub inflight: Vec<StoredInflight>,
    /// Inbound QoS 2 ids still waiting for PUBREL
    pub inbound_qos2: Vec<u16>,
    pub disconnected_at_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflight {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = PUBACK, 1 = PUBREC, 2 = PUBCOMP
    pub awaiting: u8,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// The message-level subset of v5 properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub will_delay_interval: Option<u32>,
    pub subscription_identifiers: Vec<u32>,
    pub user_properties: Vec<(String, String)>,
}

/// Everything read back at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}

pub(crate) fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn instant_to_unix_secs(instant: Instant) -> u64 {
    let elapsed = Instant::now().saturating_duration_since(instant);
    now_unix_secs().saturating_sub(elapsed.as_secs())
}

fn unix_secs_to_instant(secs: u64) -> Instant {
    let now = Instant::now();
    let ago = Duration::from_secs(now_unix_secs().saturating_sub(secs));
    now.checked_sub(ago).unwrap_or(now)
}

fn qos_from_u8(value: u8) -> Result<QoS> {
    QoS::from_u8(value)
        .ok_or_else(|| PersistenceError::Corruption(format!("invalid QoS {}", value)))
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            will_delay_interval: props.will_delay_interval,
            subscription_identifiers: props.subscription_identifiers.clone(),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(Bytes::from),
            will_delay_interval: stored.will_delay_interval,
            subscription_identifiers: stored.subscription_identifiers,
            user_properties: stored.user_properties,
            ..Default::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            packet_id: publish.packet_id,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl TryFrom<StoredPublish> for Publish {
    type Error = PersistenceError;

    fn try_from(stored: StoredPublish) -> Result<Self> {
        Ok(Publish {
            dup: false,
            qos: qos_from_u8(stored.qos)?,
            retain: stored.retain,
            topic: Arc::from(stored.topic),
            packet_id: stored.packet_id,
            payload: Bytes::from(stored.payload),
            properties: stored.properties.into(),
        })
    }
}

impl From<&Will> for StoredWill {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            properties: StoredProperties::from(&will.properties),
        }
    }
}

impl TryFrom<StoredWill> for Will {
    type Error = PersistenceError;

    fn try_from(stored: StoredWill) -> Result<Self> {
        Ok(Will {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: qos_from_u8(stored.qos)?,
            retain: stored.retain,
            properties: stored.properties.into(),
        })
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            filter: sub.filter.to_string(),
            qos: sub.options.qos as u8,
            no_local: sub.options.no_local,
            retain_as_published: sub.options.retain_as_published,
            retain_handling: sub.options.retain_handling as u8,
            subscription_id: sub.subscription_id,
        }
    }
}

impl StoredSubscription {
    fn into_subscription(self, client_id: &Arc<str>) -> Result<Subscription> {
        let options = SubscriptionOptions {
            qos: qos_from_u8(self.qos)?,
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: RetainHandling::from_u8(self.retain_handling).unwrap_or_default(),
        };
        Ok(Subscription::new(
            client_id.clone(),
            self.filter,
            options,
            self.subscription_id,
        ))
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(message: &RetainedMessage) -> Self {
        Self {
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            properties: StoredProperties::from(&message.properties),
            stored_at_secs: instant_to_unix_secs(message.stored_at),
        }
    }
}

impl TryFrom<StoredRetainedMessage> for RetainedMessage {
    type Error = PersistenceError;

    fn try_from(stored: StoredRetainedMessage) -> Result<Self> {
        Ok(RetainedMessage::new(
            stored.topic,
            Bytes::from(stored.payload),
            qos_from_u8(stored.qos)?,
            stored.properties.into(),
            unix_secs_to_instant(stored.stored_at_secs),
        ))
    }
}

impl StoredSession {
    /// Snapshot a session. Publishes still queued on the bus are stored as
    /// pending; only handshakes that reached the wire are stored as inflight.
    pub fn from_session(session: &Session) -> Self {
        let pending: Vec<Publish> = session
            .bus()
            .pending_data()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Publish(p) => Some(p),
                _ => None,
            })
            .collect();
        let queued: AHashSet<u16> = pending.iter().filter_map(|p| p.packet_id).collect();

        let (inflight, inbound_qos2) = {
            let table = session.inflight();
            let mut inflight: Vec<StoredInflight> = table
                .entries()
                .filter(|(id, _)| !queued.contains(id))
                .map(|(id, entry)| StoredInflight {
                    packet_id: id,
                    publish: StoredPublish::from(&entry.publish),
                    awaiting: match entry.awaiting {
                        AwaitedAck::PubAck => 0,
                        AwaitedAck::PubRec => 1,
                        AwaitedAck::PubComp => 2,
                    },
                    retries: entry.retries,
                })
                .collect();
            inflight.sort_by_key(|e| e.packet_id);
            let mut inbound: Vec<u16> = table.inbound_ids().collect();
            inbound.sort_unstable();
            (inflight, inbound)
        };

        let state = session.state();
        let mut subscriptions: Vec<StoredSubscription> =
            state.subscriptions.values().map(StoredSubscription::from).collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));

        Self {
            client_id: session.id().to_string(),
            protocol_version: state.protocol_version as u8,
            expiry_interval: state.expiry_interval,
            subscriptions,
            will: state.will.as_ref().map(StoredWill::from),
            pending: pending.iter().map(StoredPublish::from).collect(),
            inflight,
            inbound_qos2,
            disconnected_at_secs: state.disconnected_at.map(instant_to_unix_secs),
        }
    }

    /// Rebuild a disconnected session. Returns it with the subscriptions the
    /// caller must register in the index.
    pub fn restore(
        self,
        limits: SessionLimits,
        events: Arc<dyn EventSink>,
    ) -> Result<(Arc<Session>, Vec<Subscription>)> {
        let version = ProtocolVersion::from_u8(self.protocol_version).ok_or_else(|| {
            PersistenceError::Corruption(format!(
                "invalid protocol version {}",
                self.protocol_version
            ))
        })?;
        let session = Arc::new(Session::new(self.client_id, version, limits, events));
        let client_id = session.id().clone();

        {
            let mut table = session.inflight();
            for stored in self.inflight {
                let awaiting = match stored.awaiting {
                    0 => AwaitedAck::PubAck,
                    1 => AwaitedAck::PubRec,
                    2 => AwaitedAck::PubComp,
                    other => {
                        return Err(PersistenceError::Corruption(format!(
                            "invalid inflight state {}",
                            other
                        )))
                    }
                };
                let mut publish = Publish::try_from(stored.publish)?;
                publish.packet_id = Some(stored.packet_id);
                table.restore(
                    stored.packet_id,
                    InflightEntry {
                        publish,
                        awaiting,
                        sent_at: None,
                        retries: stored.retries,
                    },
                );
            }
            for id in self.inbound_qos2 {
                table.track_inbound(id);
            }
        }

        let subscriptions = self
            .subscriptions
            .into_iter()
            .map(|s| s.into_subscription(&client_id))
            .collect::<Result<Vec<_>>>()?;
        {
            let mut state = session.state_mut();
            state.clean_start = false;
            state.expiry_interval = self.expiry_interval;
            state.will = self.will.map(Will::try_from).transpose()?;
            state.subscriptions = subscriptions
                .iter()
                .map(|s| (s.filter.clone(), s.clone()))
                .collect();
            state.connected = false;
            state.disconnected_at = Some(
                self.disconnected_at_secs
                    .map(unix_secs_to_instant)
                    .unwrap_or_else(Instant::now),
            );
        }

        for stored in self.pending {
            let publish = Publish::try_from(stored)?;
            session
                .enqueue_publish(publish)
                .map_err(|e| PersistenceError::Corruption(e.to_string()))?;
        }

        Ok((session, subscriptions))
    }
}
