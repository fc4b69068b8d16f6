//! Dispatcher
//!
//! Owns the shared broker state (subscription index, retained store,
//! session store, connection registry) and implements every operation
//! that crosses session boundaries: publish fan-out, subscribe with
//! retained replay, will delivery and session lifecycle. Connections call
//! into it; it never touches a socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::BrokerConfig;
use crate::events::{BrokerEvent, EventSink, SessionEnd};
use crate::hooks::{Hooks, PublishDecision};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage, StoredSession};
use crate::protocol::{
    Ack, Connect, Packet, Properties, ProtocolError, ProtocolVersion, Publish, QoS, ReasonCode,
    RetainHandling, SubAck, Subscribe, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};
use crate::retained::{RetainedChange, RetainedMessage, RetainedStore};
use crate::session::{AckMatch, Session, SessionStore, EXPIRY_NEVER};
use crate::topic::{validate_topic_filter, validate_topic_name, Subscription, SubscriptionIndex};

/// A message published by the server itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl ApplicationMessage {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            properties: Properties::default(),
        }
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl From<ApplicationMessage> for Publish {
    fn from(message: ApplicationMessage) -> Self {
        let mut publish = Publish::new(message.topic, message.payload, message.qos);
        publish.retain = message.retain;
        publish.properties = message.properties;
        publish
    }
}

/// What happened to an inbound or injected publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    /// Fanned out; `matched` counts the subscribers that matched
    Dispatched { matched: usize },
    /// Retransmitted QoS 2 publish, acknowledged but not delivered again
    Duplicate,
    Rejected(ReasonCode),
    /// The publisher's connection must close with this reason
    Close(ReasonCode),
}

/// Acknowledgement to send for an inbound publish, plus its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReply {
    pub ack: Option<Packet>,
    pub result: PublishResult,
}

/// Retained replay owed to a subscriber once its SUBACK is queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedReplay {
    pub filter: Arc<str>,
    pub qos: QoS,
    pub subscription_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub suback: SubAck,
    pub replay: Vec<RetainedReplay>,
}

/// Why the dispatcher asks a live connection to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kick {
    TakenOver,
    SessionFailed,
    Administrative,
}

impl Kick {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Kick::TakenOver => ReasonCode::SessionTakenOver,
            Kick::SessionFailed => ReasonCode::UnspecifiedError,
            Kick::Administrative => ReasonCode::AdministrativeAction,
        }
    }
}

/// How a connection ended, as far as session state is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// DISCONNECT with reason 0x00; the will is discarded
    Normal,
    /// DISCONNECT with reason 0x04; the will is published
    NormalWithWill,
    /// Transport loss, timeout, violation or kick
    Lost,
    /// Retry budget or packet identifiers exhausted; the session is removed
    Failed,
}

/// Registry entry for a live connection
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub connected_at: SystemTime,
    pub(crate) kick: mpsc::Sender<Kick>,
    pub(crate) closed: watch::Receiver<()>,
}

pub struct Dispatcher {
    pub(crate) config: BrokerConfig,
    pub(crate) index: SubscriptionIndex,
    pub(crate) retained: RetainedStore,
    pub(crate) sessions: SessionStore,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) persistence: Option<Arc<PersistenceManager>>,
    clients: DashMap<Arc<str>, ConnectionHandle>,
    /// Offline sessions whose queue changed since they were last persisted
    dirty: DashSet<Arc<str>>,
    next_connection_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        events: Arc<dyn EventSink>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        Self {
            config,
            index: SubscriptionIndex::new(),
            retained: RetainedStore::new(),
            sessions: SessionStore::new(),
            hooks,
            events,
            persistence,
            clients: DashMap::new(),
            dirty: DashSet::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    // Publish

    /// Handle a PUBLISH read from `session`'s connection
    pub async fn on_publish_received(
        &self,
        session: &Arc<Session>,
        publish: Publish,
    ) -> Result<PublishReply, ProtocolError> {
        let client_id = session.id().clone();
        let v5 = session.protocol_version().is_v5();

        if let Err(reason) = validate_topic_name(&publish.topic) {
            return Err(ProtocolError::violation(format!(
                "invalid topic name '{}': {}",
                publish.topic, reason
            )));
        }
        if publish.qos > self.config.max_qos {
            debug!(client_id = %client_id, qos = ?publish.qos, "publish above maximum QoS");
            return Ok(PublishReply {
                ack: None,
                result: PublishResult::Close(ReasonCode::QoSNotSupported),
            });
        }
        if publish.retain && !self.config.retain_available {
            return Ok(PublishReply {
                ack: None,
                result: PublishResult::Close(ReasonCode::RetainNotSupported),
            });
        }

        let qos = publish.qos;
        let packet_id = match (qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => 0,
            (_, Some(id)) => id,
            (_, None) => {
                return Err(ProtocolError::violation("QoS > 0 PUBLISH without packet identifier"))
            }
        };

        if qos == QoS::ExactlyOnce && !session.on_inbound_qos2(packet_id) {
            trace!(client_id = %client_id, packet_id, "duplicate QoS 2 publish");
            return Ok(PublishReply {
                ack: Some(Packet::PubRec(Ack::new(packet_id))),
                result: PublishResult::Duplicate,
            });
        }

        let result = self.publish(Some(&client_id), publish).await;
        let reason = match result {
            PublishResult::Close(_) => {
                if qos == QoS::ExactlyOnce {
                    session.inflight().release_inbound(packet_id);
                }
                return Ok(PublishReply { ack: None, result });
            }
            PublishResult::Dispatched { matched: 0 } if v5 => ReasonCode::NoMatchingSubscribers,
            PublishResult::Rejected(code) if v5 => code,
            _ => ReasonCode::Success,
        };
        if qos == QoS::ExactlyOnce && reason.is_error() {
            session.inflight().release_inbound(packet_id);
        }

        let ack = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(Packet::PubAck(Ack::with_reason(packet_id, reason))),
            QoS::ExactlyOnce => Some(Packet::PubRec(Ack::with_reason(packet_id, reason))),
        };
        Ok(PublishReply { ack, result })
    }

    /// Run the publish hook, then fan out
    pub async fn publish(&self, sender: Option<&Arc<str>>, publish: Publish) -> PublishResult {
        match self.hooks.on_publish(sender.map(|s| &**s), &publish).await {
            Ok(PublishDecision::Accept) => {}
            Ok(PublishDecision::Reject(code)) => {
                debug!(sender = ?sender, topic = %publish.topic, ?code, "publish rejected by hook");
                return PublishResult::Rejected(code);
            }
            Ok(PublishDecision::Close(code)) => {
                debug!(sender = ?sender, topic = %publish.topic, ?code, "hook closed publisher");
                return PublishResult::Close(code);
            }
            Err(e) => {
                error!(sender = ?sender, topic = %publish.topic, "publish hook failed: {}", e);
                return PublishResult::Rejected(ReasonCode::UnspecifiedError);
            }
        }
        let matched = self.dispatch(sender, publish);
        PublishResult::Dispatched { matched }
    }

    /// Publish a server-originated message
    pub async fn inject(&self, message: ApplicationMessage) -> Result<PublishResult, ProtocolError> {
        if let Err(reason) = validate_topic_name(&message.topic) {
            return Err(ProtocolError::violation(format!(
                "invalid topic name '{}': {}",
                message.topic, reason
            )));
        }
        let mut publish = Publish::from(message);
        publish.qos = publish.qos.min(self.config.max_qos);
        publish.retain &= self.config.retain_available;
        Ok(self.publish(None, publish).await)
    }

    /// Update the retained store and queue `publish` on every matching
    /// session. Returns the number of matched subscribers.
    pub fn dispatch(&self, sender: Option<&Arc<str>>, publish: Publish) -> usize {
        if publish.retain {
            self.update_retained(&publish, Instant::now());
        }

        let routes = self
            .index
            .resolve(&publish.topic, publish.qos, sender.map(|s| &**s));
        if routes.is_empty() {
            trace!(topic = %publish.topic, "no matching subscribers");
            self.events.emit(BrokerEvent::MessageNotConsumed {
                topic: publish.topic.clone(),
                sender: sender.cloned(),
            });
            return 0;
        }

        for route in &routes {
            let Some(session) = self.sessions.get(&route.client_id) else {
                debug!(client_id = %route.client_id, "route to missing session");
                continue;
            };
            if !self.hooks.on_enqueue(&route.client_id, &publish) {
                trace!(client_id = %route.client_id, topic = %publish.topic, "enqueue vetoed");
                continue;
            }

            let mut outgoing = publish.clone();
            outgoing.qos = route.qos;
            outgoing.retain = publish.retain && route.retain_as_published;
            outgoing.properties.topic_alias = None;
            outgoing.properties.subscription_identifiers = route.subscription_ids.to_vec();

            match session.enqueue_publish(outgoing) {
                Ok(_) => {
                    if !session.is_connected() {
                        self.dirty.insert(session.id().clone());
                    }
                }
                Err(e) => {
                    warn!(client_id = %route.client_id, "delivery failed: {}", e);
                    self.fail_session(&session);
                }
            }
        }
        routes.len()
    }

    fn update_retained(&self, publish: &Publish, now: Instant) {
        let change = self.retained.update(publish, now);
        let removed = match change {
            RetainedChange::Unchanged => return,
            RetainedChange::Removed => true,
            RetainedChange::Stored | RetainedChange::Replaced => false,
        };
        debug!(topic = %publish.topic, removed, "retained message updated");
        self.events.emit(BrokerEvent::RetainedChanged {
            topic: publish.topic.clone(),
            removed,
        });

        let Some(persistence) = &self.persistence else {
            return;
        };
        if removed {
            persistence.write(PersistenceOp::DeleteRetained {
                topic: publish.topic.to_string(),
            });
        } else if let Some(message) = self.retained.get(&publish.topic) {
            persistence.write(PersistenceOp::SetRetained {
                topic: publish.topic.to_string(),
                message: StoredRetainedMessage::from(&message),
            });
        }
    }

    /// Handle PUBACK, PUBREC, PUBREL or PUBCOMP and return the packet to
    /// answer with, if any
    pub fn on_ack_received(
        &self,
        session: &Session,
        packet: Packet,
    ) -> Result<Option<Packet>, ProtocolError> {
        match packet {
            Packet::PubAck(ack) => {
                log_unmatched(session, "PUBACK", ack.packet_id, session.on_puback(ack.packet_id));
                Ok(None)
            }
            Packet::PubRec(ack) => session
                .on_pubrec(ack.packet_id, ack.reason_code)
                .map(|rel| Some(Packet::PubRel(rel))),
            Packet::PubRel(ack) => Ok(Some(Packet::PubComp(session.on_pubrel(ack.packet_id)))),
            Packet::PubComp(ack) => {
                log_unmatched(session, "PUBCOMP", ack.packet_id, session.on_pubcomp(ack.packet_id));
                Ok(None)
            }
            other => Err(ProtocolError::violation(format!(
                "{:?} is not a publish acknowledgement",
                other.packet_type()
            ))),
        }
    }

    // Subscriptions

    /// Register every filter of a SUBSCRIBE. The caller queues the SUBACK
    /// and then runs the returned replay through [`Self::replay_retained`].
    pub async fn subscribe(&self, session: &Session, subscribe: Subscribe) -> SubscribeOutcome {
        let client_id = session.id().clone();
        let subscription_id = subscribe.properties.subscription_identifiers.first().copied();
        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut replay = Vec::new();

        for entry in subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter(&entry.filter) {
                debug!(client_id = %client_id, filter = %entry.filter, "invalid filter: {}", reason);
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            match self
                .hooks
                .on_subscribe_check(&client_id, &entry.filter, entry.options.qos)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(client_id = %client_id, filter = %entry.filter, "subscription denied");
                    reason_codes.push(ReasonCode::NotAuthorized);
                    continue;
                }
                Err(e) => {
                    error!(client_id = %client_id, "subscribe hook failed: {}", e);
                    reason_codes.push(ReasonCode::UnspecifiedError);
                    continue;
                }
            }

            let granted = entry.options.qos.min(self.config.max_qos);
            let options = SubscriptionOptions {
                qos: granted,
                ..entry.options
            };
            let subscription =
                Subscription::new(client_id.clone(), entry.filter.as_str(), options, subscription_id);
            let filter = subscription.filter.clone();
            let existed = self.index.subscribe(subscription.clone());
            session
                .state_mut()
                .subscriptions
                .insert(filter.clone(), subscription);
            self.events.emit(BrokerEvent::ClientSubscribed {
                client_id: client_id.clone(),
                filter: filter.clone(),
                qos: granted,
            });

            let send_retained = match options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendAtSubscribeIfNew => !existed,
                RetainHandling::DoNotSend => false,
            };
            if send_retained && self.config.retain_available {
                replay.push(RetainedReplay {
                    filter,
                    qos: granted,
                    subscription_id,
                });
            }
            debug!(client_id = %client_id, filter = %entry.filter, ?granted, "subscribed");
            reason_codes.push(ReasonCode::granted(granted));
        }

        self.mark_dirty(session);
        SubscribeOutcome {
            suback: SubAck {
                packet_id: subscribe.packet_id,
                reason_codes,
                properties: Properties::default(),
            },
            replay,
        }
    }

    /// Queue retained messages owed by a SUBSCRIBE. Returns how many were
    /// queued.
    pub fn replay_retained(&self, session: &Session, replay: &[RetainedReplay]) -> usize {
        let now = Instant::now();
        let mut queued = 0;
        for job in replay {
            match self
                .retained
                .replay_to(session, &job.filter, job.qos, job.subscription_id, now)
            {
                Ok(count) => queued += count,
                Err(e) => {
                    warn!(client_id = %session.id(), "retained replay failed: {}", e);
                    self.fail_session(session);
                    break;
                }
            }
        }
        queued
    }

    /// Remove every filter of an UNSUBSCRIBE that the unsubscribe hook allows
    pub async fn unsubscribe(&self, session: &Session, unsubscribe: Unsubscribe) -> UnsubAck {
        let client_id = session.id();
        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for filter in &unsubscribe.filters {
            match self.hooks.on_unsubscribe_check(client_id, filter).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(client_id = %client_id, filter = %filter, "unsubscribe denied");
                    reason_codes.push(ReasonCode::NotAuthorized);
                    continue;
                }
                Err(e) => {
                    error!(client_id = %client_id, "unsubscribe hook failed: {}", e);
                    reason_codes.push(ReasonCode::UnspecifiedError);
                    continue;
                }
            }

            let removed = self.index.unsubscribe(client_id, filter);
            session.state_mut().subscriptions.remove(filter.as_str());
            trace!(client_id = %client_id, filter = %filter, removed, "unsubscribe");
            if removed {
                self.events.emit(BrokerEvent::ClientUnsubscribed {
                    client_id: client_id.clone(),
                    filter: filter.as_str().into(),
                });
                reason_codes.push(ReasonCode::Success);
            } else {
                reason_codes.push(ReasonCode::NoSubscriptionExisted);
            }
        }
        self.mark_dirty(session);
        UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }
    }

    // Session lifecycle

    /// Resume or create the session for an accepted CONNECT. Returns the
    /// session and whether existing state was resumed.
    pub fn open_session(&self, client_id: &Arc<str>, connect: &Connect) -> (Arc<Session>, bool) {
        let now = Instant::now();
        let expiry_interval = if connect.protocol_version.is_v5() {
            connect.properties.session_expiry_interval.unwrap_or(0)
        } else if connect.clean_start {
            0
        } else {
            EXPIRY_NEVER
        };

        let existing = self.sessions.get(client_id);
        let resumable = match existing {
            Some(ref session) if connect.clean_start => {
                debug!(client_id = %client_id, "clean start discards previous session");
                self.end_session(session, SessionEnd::Clean);
                None
            }
            Some(ref session) if session.is_expired(now) => {
                debug!(client_id = %client_id, "previous session expired");
                self.end_session(session, SessionEnd::Expired);
                None
            }
            other => other,
        };

        let (session, present) = match resumable {
            Some(session) => {
                info!(client_id = %client_id, "resuming session");
                (session, true)
            }
            None => {
                let session = Arc::new(Session::new(
                    client_id.clone(),
                    connect.protocol_version,
                    self.config.session,
                    self.events.clone(),
                ));
                self.sessions.insert(session.clone());
                (session, false)
            }
        };

        {
            let mut state = session.state_mut();
            state.protocol_version = connect.protocol_version;
            state.clean_start = connect.clean_start;
            state.expiry_interval = expiry_interval;
            state.keep_alive = connect.keep_alive;
            state.will = connect.will.clone();
        }
        self.dirty.remove(client_id);
        (session, present)
    }

    /// Record a new connection as live
    pub async fn on_client_connected(&self, session: &Session, present: bool, username: Option<&str>) {
        session.mark_connected();
        self.events.emit(BrokerEvent::ClientConnected {
            client_id: session.id().clone(),
            protocol_version: session.protocol_version(),
            session_present: present,
        });
        self.hooks.on_client_connected(session.id(), username).await;
    }

    /// Park the session after its connection ended. Publishes (or
    /// schedules) the will unless the client disconnected normally, then
    /// removes or persists the session according to its expiry interval.
    pub async fn on_client_disconnected(self: &Arc<Self>, session: &Arc<Session>, end: ConnectionEnd) {
        let client_id = session.id().clone();
        session.detach();
        session.mark_disconnected(Instant::now());

        match end {
            ConnectionEnd::Normal => {
                session.state_mut().will = None;
            }
            ConnectionEnd::NormalWithWill | ConnectionEnd::Lost | ConnectionEnd::Failed => {
                self.schedule_will(session).await;
            }
        }

        let expiry = session.state().expiry_interval;
        if end == ConnectionEnd::Failed {
            self.end_session(session, SessionEnd::Failed);
        } else if expiry == 0 {
            self.end_session(session, SessionEnd::Clean);
        } else {
            self.persist_session(session);
        }

        let graceful = matches!(end, ConnectionEnd::Normal | ConnectionEnd::NormalWithWill);
        info!(client_id = %client_id, graceful, "client disconnected");
        self.events.emit(BrokerEvent::ClientDisconnected {
            client_id: client_id.clone(),
            graceful,
        });
        self.hooks.on_client_disconnected(&client_id, graceful).await;
    }

    /// Publish the will now, or after its delay interval if the client has
    /// not reconnected by then. The delay never outlives the session.
    pub(crate) async fn schedule_will(self: &Arc<Self>, session: &Arc<Session>) {
        let (will, expiry, disconnected_at) = {
            let mut state = session.state_mut();
            let Some(will) = state.will.take() else {
                return;
            };
            (will, state.expiry_interval, state.disconnected_at)
        };

        let delay = will.properties.will_delay_interval.unwrap_or(0).min(expiry);
        if delay == 0 {
            self.send_will(session.id(), will).await;
            return;
        }

        debug!(client_id = %session.id(), delay, "will delayed");
        let dispatcher = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay.into())).await;
            let replaced = dispatcher
                .sessions
                .get(session.id())
                .is_some_and(|current| !Arc::ptr_eq(&current, &session));
            let still_away = {
                let state = session.state();
                !state.connected && state.disconnected_at == disconnected_at
            };
            if still_away && !replaced {
                dispatcher.send_will(session.id(), will).await;
            } else {
                debug!(client_id = %session.id(), "client returned, will cancelled");
            }
        });
    }

    /// Publish a will as if its client had sent it, hooks included
    async fn send_will(&self, client_id: &Arc<str>, will: Will) {
        let mut publish = Publish::new(will.topic.as_str(), will.payload, will.qos.min(self.config.max_qos));
        publish.retain = will.retain && self.config.retain_available;
        publish.properties = will.properties;
        publish.properties.will_delay_interval = None;
        match self.publish(Some(client_id), publish).await {
            PublishResult::Dispatched { matched } => {
                debug!(client_id = %client_id, topic = %will.topic, matched, "will published");
            }
            result => {
                debug!(client_id = %client_id, topic = %will.topic, ?result, "will not published");
            }
        }
    }

    /// Remove a session and everything it subscribed. No-op if the store
    /// already holds a different session under the same id.
    pub fn end_session(&self, session: &Session, reason: SessionEnd) -> bool {
        if !self.sessions.remove_if_same(session) {
            return false;
        }
        let client_id = session.id().clone();
        self.index.unsubscribe_all(&client_id);
        session.close();
        self.dirty.remove(&client_id);
        debug!(client_id = %client_id, ?reason, "session removed");
        if let Some(persistence) = &self.persistence {
            persistence.write(PersistenceOp::DeleteSession {
                client_id: client_id.to_string(),
            });
        }
        self.events.emit(BrokerEvent::SessionDeleted { client_id, reason });
        true
    }

    /// End a session whose delivery state broke. A live connection is told
    /// to close and ends the session on its way out.
    fn fail_session(&self, session: &Session) {
        if !self.kick(session.id(), Kick::SessionFailed) {
            self.end_session(session, SessionEnd::Failed);
        }
    }

    /// Expire sessions, purge expired retained messages and persist offline
    /// sessions that received messages
    pub async fn sweep(&self, now: Instant) {
        for session in self.sessions.take_expired(now) {
            let client_id = session.id().clone();
            self.index.unsubscribe_all(&client_id);
            let will = session.state_mut().will.take();
            if let Some(will) = will {
                self.send_will(&client_id, will).await;
            }
            session.close();
            self.dirty.remove(&client_id);
            info!(client_id = %client_id, "session expired");
            if let Some(persistence) = &self.persistence {
                persistence.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
            self.events.emit(BrokerEvent::SessionDeleted {
                client_id,
                reason: SessionEnd::Expired,
            });
        }

        for topic in self.retained.purge_expired(now) {
            trace!(topic = %topic, "retained message expired");
            if let Some(persistence) = &self.persistence {
                persistence.write(PersistenceOp::DeleteRetained {
                    topic: topic.to_string(),
                });
            }
            self.events.emit(BrokerEvent::RetainedChanged {
                topic,
                removed: true,
            });
        }

        let dirty: Vec<Arc<str>> = self.dirty.iter().map(|id| id.key().clone()).collect();
        for client_id in dirty {
            self.dirty.remove(&client_id);
            if let Some(session) = self.sessions.get(&client_id) {
                if !session.is_connected() {
                    self.persist_session(&session);
                }
            }
        }
    }

    fn mark_dirty(&self, session: &Session) {
        if self.persistence.is_some() && session.state().expiry_interval > 0 {
            self.dirty.insert(session.id().clone());
        }
    }

    fn persist_session(&self, session: &Session) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if session.state().expiry_interval == 0 {
            return;
        }
        persistence.write(PersistenceOp::SetSession {
            client_id: session.id().to_string(),
            session: StoredSession::from_session(session),
        });
    }

    /// Queue a snapshot of every session that outlives its connection
    pub fn persist_all(&self) -> usize {
        let mut count = 0;
        for session in self.sessions.snapshot() {
            if session.state().expiry_interval > 0 {
                self.persist_session(&session);
                count += 1;
            }
        }
        count
    }

    /// Install state loaded from persistence
    pub fn restore_session(&self, session: Arc<Session>, subscriptions: Vec<Subscription>) {
        for subscription in subscriptions {
            self.index.subscribe(subscription);
        }
        self.sessions.insert(session);
    }

    pub fn restore_retained(&self, message: RetainedMessage) {
        self.retained.insert(message);
    }

    /// Drop a session through the status API, closing its connection first.
    /// `false` if there was no such session.
    pub async fn delete_session(&self, client_id: &str) -> bool {
        let Some(session) = self.sessions.get(client_id) else {
            return false;
        };
        self.kick_and_wait(client_id, Kick::Administrative).await;
        // a zero-expiry session is already gone once its connection closed
        self.end_session(&session, SessionEnd::Deleted);
        true
    }

    // Connection registry

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, client_id: Arc<str>, handle: ConnectionHandle) {
        if let Some(previous) = self.clients.insert(client_id.clone(), handle) {
            warn!(client_id = %client_id, connection = previous.id, "replaced registry entry");
        }
    }

    /// Remove the registry entry if it still belongs to `connection_id`
    pub(crate) fn unregister(&self, client_id: &str, connection_id: u64) -> bool {
        self.clients
            .remove_if(client_id, |_, handle| handle.id == connection_id)
            .is_some()
    }

    /// Ask a live connection to close. `false` if none is registered.
    pub fn kick(&self, client_id: &str, kick: Kick) -> bool {
        match self.clients.get(client_id) {
            Some(handle) => {
                let _ = handle.kick.try_send(kick);
                true
            }
            None => false,
        }
    }

    /// Kick a live connection and wait until it has finished tearing down
    pub(crate) async fn kick_and_wait(&self, client_id: &str, kick: Kick) -> bool {
        let closed = match self.clients.get(client_id) {
            Some(handle) => {
                let _ = handle.kick.try_send(kick);
                handle.closed.clone()
            }
            None => return false,
        };
        let mut closed = closed;
        let wait = closed.changed();
        if tokio::time::timeout(self.config.connect_timeout, wait).await.is_err() {
            warn!(client_id = %client_id, ?kick, "previous connection did not close in time");
        }
        true
    }

    pub fn is_client_connected(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn clients(&self) -> &DashMap<Arc<str>, ConnectionHandle> {
        &self.clients
    }
}

fn log_unmatched(session: &Session, kind: &str, packet_id: u16, matched: AckMatch) {
    if matched != AckMatch::Matched {
        debug!(client_id = %session.id(), packet_id, ?matched, "unmatched {}", kind);
    }
}
