//! Broker tests
//!
//! The first half drives the [`Dispatcher`] directly; the second runs whole
//! connections over in-memory duplex streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use super::*;
use crate::codec::{Decoder, Encoder};
use crate::events::testing::RecordingEvents;
use crate::events::SessionEnd;
use crate::hooks::{HookResult, PublishDecision};
use crate::persistence::{MemoryBackend, StorageBackend};
use crate::protocol::{
    Ack, Connect, Disconnect, Packet, Properties, Publish, ReasonCode, RetainHandling, Subscribe,
    Subscription, SubscriptionOptions, Unsubscribe, Will,
};
use crate::session::{Completion, Session};

const TIMEOUT: Duration = Duration::from_secs(5);

fn dispatcher_with(
    config: BrokerConfig,
    hooks: Arc<dyn Hooks>,
) -> (Arc<Dispatcher>, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::default());
    let dispatcher = Arc::new(Dispatcher::new(config, hooks, events.clone(), None));
    (dispatcher, events)
}

fn dispatcher() -> (Arc<Dispatcher>, Arc<RecordingEvents>) {
    dispatcher_with(BrokerConfig::default(), Arc::new(DefaultHooks))
}

fn connect_packet(client_id: &str, version: ProtocolVersion) -> Connect {
    Connect {
        protocol_version: version,
        client_id: client_id.to_string(),
        ..Connect::default()
    }
}

async fn online(dispatcher: &Dispatcher, connect: &Connect) -> Arc<Session> {
    let client_id: Arc<str> = connect.client_id.as_str().into();
    let (session, present) = dispatcher.open_session(&client_id, connect);
    dispatcher.on_client_connected(&session, present, None).await;
    session
}

async fn client(dispatcher: &Dispatcher, client_id: &str) -> Arc<Session> {
    online(dispatcher, &connect_packet(client_id, ProtocolVersion::V5)).await
}

fn subscribe_packet(filter: &str, options: SubscriptionOptions) -> Subscribe {
    Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: filter.to_string(),
            options,
        }],
        properties: Properties::default(),
    }
}

async fn subscribe(dispatcher: &Dispatcher, session: &Session, filter: &str, qos: QoS) -> SubscribeOutcome {
    dispatcher
        .subscribe(session, subscribe_packet(filter, SubscriptionOptions::with_qos(qos)))
        .await
}

fn publish(topic: &str, payload: &'static str, qos: QoS, packet_id: u16) -> Publish {
    let mut publish = Publish::new(topic, Bytes::from_static(payload.as_bytes()), qos);
    if qos != QoS::AtMostOnce {
        publish.packet_id = Some(packet_id);
    }
    publish
}

fn drain(session: &Session) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Some(item) = session.bus().try_dequeue() {
        packets.push(item.complete(Completion::Delivered));
    }
    packets
}

fn delivered(session: &Session) -> Vec<Publish> {
    drain(session)
        .into_iter()
        .filter_map(|packet| match packet {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect()
}

/// Rejects `private/...`, closes the publisher on `forbidden/...`, denies
/// subscriptions to `secret/#` and never queues for client "muted"
struct Policy;

#[async_trait]
impl Hooks for Policy {
    async fn on_publish(&self, _sender: Option<&str>, publish: &Publish) -> HookResult<PublishDecision> {
        Ok(if publish.topic.starts_with("private/") {
            PublishDecision::Reject(ReasonCode::NotAuthorized)
        } else if publish.topic.starts_with("forbidden/") {
            PublishDecision::Close(ReasonCode::AdministrativeAction)
        } else {
            PublishDecision::Accept
        })
    }

    async fn on_subscribe_check(&self, _client_id: &str, filter: &str, _qos: QoS) -> HookResult<bool> {
        Ok(!filter.starts_with("secret/"))
    }

    async fn on_unsubscribe_check(&self, _client_id: &str, filter: &str) -> HookResult<bool> {
        Ok(!filter.starts_with("pinned/"))
    }

    fn on_enqueue(&self, client_id: &str, _publish: &Publish) -> bool {
        client_id != "muted"
    }
}

// Configuration

#[test]
fn default_config_is_valid() {
    assert!(BrokerConfig::default().validate().is_ok());
}

#[test_case::test_case(|c: &mut BrokerConfig| c.session.max_pending_messages = 0 ; "empty queue")]
#[test_case::test_case(|c: &mut BrokerConfig| c.max_retries = 0 ; "no retries with ack timeout")]
#[test_case::test_case(|c: &mut BrokerConfig| c.max_packet_size = 0 ; "zero packet size")]
#[test_case::test_case(|c: &mut BrokerConfig| c.connect_timeout = Duration::ZERO ; "zero connect timeout")]
#[test_case::test_case(|c: &mut BrokerConfig| c.expiry_check_interval = Duration::ZERO ; "zero sweep interval")]
fn invalid_config_is_rejected(tweak: fn(&mut BrokerConfig)) {
    let mut config = BrokerConfig::default();
    tweak(&mut config);
    assert!(config.validate().is_err());
    assert!(Broker::new(config).is_err());
}

#[test]
fn retries_may_be_zero_without_ack_timeout() {
    let config = BrokerConfig {
        max_retries: 0,
        ack_timeout: Duration::ZERO,
        ..BrokerConfig::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn retry_interval_is_clamped() {
    let mut config = BrokerConfig::default();
    assert_eq!(config.retry_interval(), Duration::from_secs(1));
    config.ack_timeout = Duration::from_millis(50);
    assert_eq!(config.retry_interval(), Duration::from_millis(100));
}

// Publish fan-out

#[tokio::test]
async fn overlapping_subscriptions_deliver_once_at_highest_qos() {
    let (dispatcher, _) = dispatcher();
    let sub = client(&dispatcher, "sub").await;
    let publisher = client(&dispatcher, "pub").await;
    subscribe(&dispatcher, &sub, "a/#", QoS::AtLeastOnce).await;
    subscribe(&dispatcher, &sub, "a/b", QoS::ExactlyOnce).await;
    drain(&sub);

    let reply = dispatcher
        .on_publish_received(&publisher, publish("a/b", "x", QoS::ExactlyOnce, 7))
        .await
        .unwrap();
    assert_eq!(reply.result, PublishResult::Dispatched { matched: 1 });
    assert_eq!(reply.ack, Some(Packet::PubRec(Ack::new(7))));

    let got = delivered(&sub);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::ExactlyOnce);
    assert_eq!(got[0].payload, "x");
}

#[tokio::test]
async fn delivery_qos_is_capped_by_subscription() {
    let (dispatcher, _) = dispatcher();
    let sub = client(&dispatcher, "sub").await;
    subscribe(&dispatcher, &sub, "t", QoS::AtMostOnce).await;
    drain(&sub);

    dispatcher.dispatch(None, publish("t", "x", QoS::ExactlyOnce, 1));
    let got = delivered(&sub);
    assert_eq!(got[0].qos, QoS::AtMostOnce);
    assert_eq!(got[0].packet_id, None);
}

#[tokio::test]
async fn unmatched_publish_reports_no_subscribers_on_v5_only() {
    let (dispatcher, events) = dispatcher();
    let v5 = client(&dispatcher, "v5").await;
    let v3 = online(&dispatcher, &connect_packet("v3", ProtocolVersion::V311)).await;
    events.take();

    let reply = dispatcher
        .on_publish_received(&v5, publish("nobody/home", "x", QoS::AtLeastOnce, 1))
        .await
        .unwrap();
    assert_eq!(
        reply.ack,
        Some(Packet::PubAck(Ack::with_reason(1, ReasonCode::NoMatchingSubscribers)))
    );

    let reply = dispatcher
        .on_publish_received(&v3, publish("nobody/home", "x", QoS::AtLeastOnce, 2))
        .await
        .unwrap();
    assert_eq!(reply.ack, Some(Packet::PubAck(Ack::new(2))));

    let not_consumed = events
        .take()
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::MessageNotConsumed { .. }))
        .count();
    assert_eq!(not_consumed, 2);
}

#[tokio::test]
async fn duplicate_qos2_publish_is_acknowledged_but_not_redelivered() {
    let (dispatcher, _) = dispatcher();
    let sub = client(&dispatcher, "sub").await;
    let publisher = client(&dispatcher, "pub").await;
    subscribe(&dispatcher, &sub, "q", QoS::ExactlyOnce).await;
    drain(&sub);

    let first = dispatcher
        .on_publish_received(&publisher, publish("q", "once", QoS::ExactlyOnce, 9))
        .await
        .unwrap();
    let mut retry = publish("q", "once", QoS::ExactlyOnce, 9);
    retry.dup = true;
    let second = dispatcher.on_publish_received(&publisher, retry).await.unwrap();

    assert_eq!(first.result, PublishResult::Dispatched { matched: 1 });
    assert_eq!(second.result, PublishResult::Duplicate);
    assert_eq!(second.ack, Some(Packet::PubRec(Ack::new(9))));
    assert_eq!(delivered(&sub).len(), 1);

    let comp = dispatcher
        .on_ack_received(&publisher, Packet::PubRel(Ack::new(9)))
        .unwrap();
    assert_eq!(comp, Some(Packet::PubComp(Ack::new(9))));

    // the id is free again, so the same id starts a new message
    let third = dispatcher
        .on_publish_received(&publisher, publish("q", "again", QoS::ExactlyOnce, 9))
        .await
        .unwrap();
    assert_eq!(third.result, PublishResult::Dispatched { matched: 1 });
}

#[tokio::test]
async fn no_local_skips_the_publisher() {
    let (dispatcher, _) = dispatcher();
    let session = client(&dispatcher, "echo").await;
    let options = SubscriptionOptions {
        no_local: true,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    dispatcher.subscribe(&session, subscribe_packet("chat", options)).await;
    drain(&session);

    let reply = dispatcher
        .on_publish_received(&session, publish("chat", "hi", QoS::AtMostOnce, 0))
        .await
        .unwrap();
    assert_eq!(reply.result, PublishResult::Dispatched { matched: 0 });
    assert!(delivered(&session).is_empty());
}

#[tokio::test]
async fn publish_hook_rejects_and_closes() {
    let (dispatcher, _) = dispatcher_with(BrokerConfig::default(), Arc::new(Policy));
    let sub = client(&dispatcher, "sub").await;
    let publisher = client(&dispatcher, "pub").await;
    subscribe(&dispatcher, &sub, "#", QoS::AtLeastOnce).await;
    drain(&sub);

    let rejected = dispatcher
        .on_publish_received(&publisher, publish("private/x", "x", QoS::AtLeastOnce, 1))
        .await
        .unwrap();
    assert_eq!(rejected.result, PublishResult::Rejected(ReasonCode::NotAuthorized));
    assert_eq!(
        rejected.ack,
        Some(Packet::PubAck(Ack::with_reason(1, ReasonCode::NotAuthorized)))
    );

    let closed = dispatcher
        .on_publish_received(&publisher, publish("forbidden/x", "x", QoS::ExactlyOnce, 2))
        .await
        .unwrap();
    assert_eq!(closed.result, PublishResult::Close(ReasonCode::AdministrativeAction));
    assert_eq!(closed.ack, None);
    assert!(delivered(&sub).is_empty());
}

#[tokio::test]
async fn enqueue_hook_vetoes_one_subscriber() {
    let (dispatcher, _) = dispatcher_with(BrokerConfig::default(), Arc::new(Policy));
    let muted = client(&dispatcher, "muted").await;
    let loud = client(&dispatcher, "loud").await;
    subscribe(&dispatcher, &muted, "news", QoS::AtMostOnce).await;
    subscribe(&dispatcher, &loud, "news", QoS::AtMostOnce).await;
    drain(&muted);
    drain(&loud);

    dispatcher.dispatch(None, publish("news", "x", QoS::AtMostOnce, 0));
    assert!(delivered(&muted).is_empty());
    assert_eq!(delivered(&loud).len(), 1);
}

#[tokio::test]
async fn publish_above_maximum_qos_closes_connection() {
    let config = BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        ..BrokerConfig::default()
    };
    let (dispatcher, _) = dispatcher_with(config, Arc::new(DefaultHooks));
    let session = client(&dispatcher, "c").await;

    let reply = dispatcher
        .on_publish_received(&session, publish("t", "x", QoS::ExactlyOnce, 1))
        .await
        .unwrap();
    assert_eq!(reply.result, PublishResult::Close(ReasonCode::QoSNotSupported));

    let outcome = subscribe(&dispatcher, &session, "t", QoS::ExactlyOnce).await;
    assert_eq!(outcome.suback.reason_codes, vec![ReasonCode::GrantedQoS1]);
}

#[tokio::test]
async fn invalid_topic_name_is_a_protocol_error() {
    let (dispatcher, _) = dispatcher();
    let session = client(&dispatcher, "c").await;
    let result = dispatcher
        .on_publish_received(&session, publish("a/+/b", "x", QoS::AtMostOnce, 0))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn inject_publishes_as_the_server() {
    let config = BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        retain_available: false,
        ..BrokerConfig::default()
    };
    let (dispatcher, _) = dispatcher_with(config, Arc::new(DefaultHooks));
    let sub = client(&dispatcher, "sub").await;
    subscribe(&dispatcher, &sub, "$SYS/uptime", QoS::ExactlyOnce).await;
    drain(&sub);

    let message = ApplicationMessage::new("$SYS/uptime", "42", QoS::ExactlyOnce).retain(true);
    let result = dispatcher.inject(message).await.unwrap();
    assert_eq!(result, PublishResult::Dispatched { matched: 1 });

    let got = delivered(&sub);
    assert_eq!(got[0].qos, QoS::AtLeastOnce);
    assert!(!got[0].retain);
    assert!(dispatcher.retained().is_empty());

    assert!(dispatcher
        .inject(ApplicationMessage::new("bad/#", "x", QoS::AtMostOnce))
        .await
        .is_err());
}

// Subscriptions and retained replay

#[tokio::test]
async fn retained_replay_follows_suback_and_precedes_live_messages() {
    let (dispatcher, _) = dispatcher();
    dispatcher
        .inject(ApplicationMessage::new("status/temp", "21", QoS::AtLeastOnce).retain(true))
        .await
        .unwrap();

    let session = client(&dispatcher, "watcher").await;
    let outcome = subscribe(&dispatcher, &session, "status/+", QoS::AtLeastOnce).await;
    assert_eq!(outcome.replay.len(), 1);
    session.enqueue_control(Packet::SubAck(outcome.suback));
    assert_eq!(dispatcher.replay_retained(&session, &outcome.replay), 1);
    dispatcher.dispatch(None, publish("status/temp", "22", QoS::AtLeastOnce, 0));

    let packets = drain(&session);
    assert!(matches!(packets[0], Packet::SubAck(_)));
    let publishes: Vec<(Bytes, bool)> = packets[1..]
        .iter()
        .map(|p| match p {
            Packet::Publish(p) => (p.payload.clone(), p.retain),
            other => panic!("expected PUBLISH, got {:?}", other),
        })
        .collect();
    assert_eq!(
        publishes,
        vec![(Bytes::from_static(b"21"), true), (Bytes::from_static(b"22"), false)]
    );
}

#[tokio::test]
async fn retain_handling_controls_replay() {
    let (dispatcher, _) = dispatcher();
    dispatcher
        .inject(ApplicationMessage::new("r", "v", QoS::AtMostOnce).retain(true))
        .await
        .unwrap();
    let session = client(&dispatcher, "c").await;

    let if_new = SubscriptionOptions {
        retain_handling: RetainHandling::SendAtSubscribeIfNew,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    let first = dispatcher.subscribe(&session, subscribe_packet("r", if_new)).await;
    let again = dispatcher.subscribe(&session, subscribe_packet("r", if_new)).await;
    assert_eq!(first.replay.len(), 1);
    assert!(again.replay.is_empty());

    let never = SubscriptionOptions {
        retain_handling: RetainHandling::DoNotSend,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    let outcome = dispatcher.subscribe(&session, subscribe_packet("+", never)).await;
    assert!(outcome.replay.is_empty());
}

#[tokio::test]
async fn empty_retained_payload_clears_topic() {
    let (dispatcher, events) = dispatcher();
    dispatcher.dispatch(None, {
        let mut p = publish("lamp", "on", QoS::AtMostOnce, 0);
        p.retain = true;
        p
    });
    assert_eq!(dispatcher.retained().len(), 1);

    let mut clear = Publish::new("lamp", Bytes::new(), QoS::AtMostOnce);
    clear.retain = true;
    dispatcher.dispatch(None, clear);
    assert!(dispatcher.retained().is_empty());

    let changes: Vec<bool> = events
        .take()
        .into_iter()
        .filter_map(|e| match e {
            BrokerEvent::RetainedChanged { removed, .. } => Some(removed),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![false, true]);
}

#[tokio::test]
async fn subscribe_reports_per_filter_failures() {
    let (dispatcher, _) = dispatcher_with(BrokerConfig::default(), Arc::new(Policy));
    let session = client(&dispatcher, "c").await;
    let packet = Subscribe {
        packet_id: 3,
        subscriptions: ["ok/+", "bad/#/x", "secret/#"]
            .into_iter()
            .map(|filter| Subscription {
                filter: filter.to_string(),
                options: SubscriptionOptions::with_qos(QoS::AtLeastOnce),
            })
            .collect(),
        properties: Properties::default(),
    };
    let outcome = dispatcher.subscribe(&session, packet).await;
    assert_eq!(outcome.suback.packet_id, 3);
    assert_eq!(
        outcome.suback.reason_codes,
        vec![
            ReasonCode::GrantedQoS1,
            ReasonCode::TopicFilterInvalid,
            ReasonCode::NotAuthorized,
        ]
    );
    assert_eq!(session.state().subscriptions.len(), 1);
}

#[tokio::test]
async fn subscription_identifier_travels_with_delivery() {
    let (dispatcher, _) = dispatcher();
    let session = client(&dispatcher, "c").await;
    let mut packet = subscribe_packet("ids/#", SubscriptionOptions::with_qos(QoS::AtMostOnce));
    packet.properties.subscription_identifiers = vec![17];
    dispatcher.subscribe(&session, packet).await;

    dispatcher.dispatch(None, publish("ids/a", "x", QoS::AtMostOnce, 0));
    let got = delivered(&session);
    assert_eq!(got[0].properties.subscription_identifiers, vec![17]);
}

#[tokio::test]
async fn unsubscribe_reports_missing_filters() {
    let (dispatcher, events) = dispatcher();
    let session = client(&dispatcher, "c").await;
    subscribe(&dispatcher, &session, "a", QoS::AtMostOnce).await;

    let unsuback = dispatcher
        .unsubscribe(
            &session,
            Unsubscribe {
                packet_id: 4,
                filters: vec!["a".into(), "b".into()],
                properties: Properties::default(),
            },
        )
        .await;
    assert_eq!(
        unsuback.reason_codes,
        vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
    );
    assert!(dispatcher.index().is_empty());

    let changes: Vec<BrokerEvent> = events
        .take()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                BrokerEvent::ClientSubscribed { .. } | BrokerEvent::ClientUnsubscribed { .. }
            )
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            BrokerEvent::ClientSubscribed {
                client_id: "c".into(),
                filter: "a".into(),
                qos: QoS::AtMostOnce,
            },
            BrokerEvent::ClientUnsubscribed {
                client_id: "c".into(),
                filter: "a".into(),
            },
        ]
    );
}

#[tokio::test]
async fn unsubscribe_hook_keeps_pinned_filters() {
    let (dispatcher, events) = dispatcher_with(BrokerConfig::default(), Arc::new(Policy));
    let session = client(&dispatcher, "c").await;
    subscribe(&dispatcher, &session, "pinned/alerts", QoS::AtMostOnce).await;
    subscribe(&dispatcher, &session, "news", QoS::AtMostOnce).await;
    events.take();

    let unsuback = dispatcher
        .unsubscribe(
            &session,
            Unsubscribe {
                packet_id: 5,
                filters: vec!["pinned/alerts".into(), "news".into()],
                properties: Properties::default(),
            },
        )
        .await;
    assert_eq!(
        unsuback.reason_codes,
        vec![ReasonCode::NotAuthorized, ReasonCode::Success]
    );
    assert_eq!(dispatcher.index().len(), 1);
    assert!(session.state().subscriptions.contains_key("pinned/alerts"));

    dispatcher.dispatch(None, publish("pinned/alerts", "still here", QoS::AtMostOnce, 0));
    assert_eq!(delivered(&session).len(), 1);
    let unsubscribed = events
        .take()
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::ClientUnsubscribed { .. }))
        .count();
    assert_eq!(unsubscribed, 1);
}

// Session lifecycle

#[tokio::test]
async fn session_resumes_unless_clean_start() {
    let (dispatcher, events) = dispatcher();
    let mut connect = connect_packet("keeper", ProtocolVersion::V5);
    connect.clean_start = false;
    connect.properties.session_expiry_interval = Some(300);

    let session = online(&dispatcher, &connect).await;
    subscribe(&dispatcher, &session, "k", QoS::AtLeastOnce).await;
    dispatcher
        .on_client_disconnected(&session, ConnectionEnd::Normal)
        .await;

    dispatcher.dispatch(None, publish("k", "while away", QoS::AtLeastOnce, 0));
    assert_eq!(session.pending_count(), 1);

    let client_id: Arc<str> = "keeper".into();
    let (resumed, present) = dispatcher.open_session(&client_id, &connect);
    assert!(present);
    assert!(Arc::ptr_eq(&resumed, &session));

    connect.clean_start = true;
    events.take();
    let (fresh, present) = dispatcher.open_session(&client_id, &connect);
    assert!(!present);
    assert!(!Arc::ptr_eq(&fresh, &session));
    assert!(dispatcher.index().client_subscriptions("keeper").is_empty());
    assert!(events.take().contains(&BrokerEvent::SessionDeleted {
        client_id,
        reason: SessionEnd::Clean,
    }));
}

#[tokio::test]
async fn zero_expiry_session_ends_with_connection() {
    let (dispatcher, _) = dispatcher();
    let session = client(&dispatcher, "brief").await;
    subscribe(&dispatcher, &session, "x", QoS::AtMostOnce).await;

    dispatcher.on_client_disconnected(&session, ConnectionEnd::Lost).await;
    assert!(dispatcher.sessions().get("brief").is_none());
    assert!(dispatcher.index().is_empty());
}

#[tokio::test]
async fn v311_persistent_session_never_expires() {
    let (dispatcher, _) = dispatcher();
    let mut connect = connect_packet("old", ProtocolVersion::V311);
    connect.clean_start = false;
    let session = online(&dispatcher, &connect).await;
    dispatcher.on_client_disconnected(&session, ConnectionEnd::Lost).await;

    dispatcher.sweep(Instant::now() + Duration::from_secs(365 * 24 * 3600)).await;
    assert!(dispatcher.sessions().get("old").is_some());
}

#[tokio::test]
async fn sweep_expires_parked_sessions_and_sends_their_will() {
    let (dispatcher, events) = dispatcher();
    let watcher = client(&dispatcher, "watcher").await;
    subscribe(&dispatcher, &watcher, "wills/#", QoS::AtMostOnce).await;
    drain(&watcher);

    let mut connect = connect_packet("short", ProtocolVersion::V5);
    connect.properties.session_expiry_interval = Some(1);
    let mut will_properties = Properties::default();
    will_properties.will_delay_interval = Some(3600);
    connect.will = Some(Will {
        topic: "wills/short".into(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: will_properties,
    });
    let session = online(&dispatcher, &connect).await;
    subscribe(&dispatcher, &session, "s", QoS::AtMostOnce).await;

    // the hour-long will delay is capped at the one second session expiry
    dispatcher.on_client_disconnected(&session, ConnectionEnd::Lost).await;
    events.take();

    dispatcher.sweep(Instant::now() + Duration::from_secs(10)).await;
    assert!(dispatcher.sessions().get("short").is_none());
    assert!(dispatcher.index().client_subscriptions("short").is_empty());
    assert!(events.take().contains(&BrokerEvent::SessionDeleted {
        client_id: "short".into(),
        reason: SessionEnd::Expired,
    }));

    let item = tokio::time::timeout(TIMEOUT, watcher.bus().dequeue())
        .await
        .unwrap()
        .unwrap();
    match item.complete(Completion::Delivered) {
        Packet::Publish(p) => assert_eq!(p.payload, "gone"),
        other => panic!("expected will, got {:?}", other),
    }
}

#[tokio::test]
async fn will_passes_through_the_publish_hook() {
    let (dispatcher, _) = dispatcher_with(BrokerConfig::default(), Arc::new(Policy));
    let watcher = client(&dispatcher, "watcher").await;
    subscribe(&dispatcher, &watcher, "#", QoS::AtMostOnce).await;
    drain(&watcher);

    let lost_with_will = |id: &str, topic: &str| {
        let mut connect = connect_packet(id, ProtocolVersion::V5);
        connect.will = Some(Will {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtMostOnce,
            retain: true,
            properties: Properties::default(),
        });
        connect
    };

    let hidden = online(&dispatcher, &lost_with_will("hidden", "private/hidden")).await;
    dispatcher.on_client_disconnected(&hidden, ConnectionEnd::Lost).await;
    let banned = online(&dispatcher, &lost_with_will("banned", "forbidden/banned")).await;
    dispatcher.on_client_disconnected(&banned, ConnectionEnd::Lost).await;
    assert!(delivered(&watcher).is_empty());
    assert_eq!(dispatcher.retained().len(), 0);

    let open = online(&dispatcher, &lost_with_will("open", "status/open")).await;
    dispatcher.on_client_disconnected(&open, ConnectionEnd::Lost).await;
    let got = delivered(&watcher);
    assert_eq!(got.len(), 1);
    assert_eq!(&*got[0].topic, "status/open");
    assert_eq!(dispatcher.retained().len(), 1);
}

#[tokio::test]
async fn will_is_published_on_ungraceful_end_only() {
    let (dispatcher, _) = dispatcher();
    let watcher = client(&dispatcher, "watcher").await;
    subscribe(&dispatcher, &watcher, "wills/+", QoS::AtLeastOnce).await;
    drain(&watcher);

    let with_will = |id: &str| {
        let mut connect = connect_packet(id, ProtocolVersion::V5);
        connect.will = Some(Will {
            topic: format!("wills/{}", id),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: Properties::default(),
        });
        connect
    };

    let polite = online(&dispatcher, &with_will("polite")).await;
    dispatcher.on_client_disconnected(&polite, ConnectionEnd::Normal).await;
    assert!(delivered(&watcher).is_empty());

    let crashed = online(&dispatcher, &with_will("crashed")).await;
    dispatcher.on_client_disconnected(&crashed, ConnectionEnd::Lost).await;
    let wills = delivered(&watcher);
    assert_eq!(wills.len(), 1);
    assert_eq!(&*wills[0].topic, "wills/crashed");
    assert!(dispatcher.retained().get("wills/crashed").is_some());

    let leaving = online(&dispatcher, &with_will("leaving")).await;
    dispatcher
        .on_client_disconnected(&leaving, ConnectionEnd::NormalWithWill)
        .await;
    assert_eq!(delivered(&watcher).len(), 1);
}

#[tokio::test]
async fn failed_session_is_removed_even_with_expiry() {
    let (dispatcher, events) = dispatcher();
    let mut connect = connect_packet("broken", ProtocolVersion::V5);
    connect.properties.session_expiry_interval = Some(600);
    let session = online(&dispatcher, &connect).await;
    events.take();

    dispatcher.on_client_disconnected(&session, ConnectionEnd::Failed).await;
    assert!(dispatcher.sessions().get("broken").is_none());
    assert!(events.take().contains(&BrokerEvent::SessionDeleted {
        client_id: "broken".into(),
        reason: SessionEnd::Failed,
    }));
}

#[tokio::test]
async fn ending_a_replaced_session_leaves_the_new_one_alone() {
    let (dispatcher, _) = dispatcher();
    let mut connect = connect_packet("twin", ProtocolVersion::V5);
    connect.properties.session_expiry_interval = Some(60);
    let old = online(&dispatcher, &connect).await;

    connect.clean_start = true;
    let new = online(&dispatcher, &connect).await;
    subscribe(&dispatcher, &new, "twin/t", QoS::AtMostOnce).await;

    assert!(!dispatcher.end_session(&old, SessionEnd::Failed));
    assert!(dispatcher.sessions().get("twin").is_some());
    assert_eq!(dispatcher.index().client_subscriptions("twin").len(), 1);
}

#[tokio::test]
async fn offline_sessions_are_persisted_by_sweep() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = Arc::new(PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000));
    let dispatcher = Arc::new(Dispatcher::new(
        BrokerConfig::default(),
        Arc::new(DefaultHooks),
        Arc::new(crate::events::NoopEvents),
        Some(manager.clone()),
    ));

    let mut connect = connect_packet("durable", ProtocolVersion::V5);
    connect.clean_start = false;
    connect.properties.session_expiry_interval = Some(3600);
    let session = online(&dispatcher, &connect).await;
    subscribe(&dispatcher, &session, "d", QoS::AtLeastOnce).await;
    dispatcher.on_client_disconnected(&session, ConnectionEnd::Lost).await;

    let mut retained = publish("d", "kept", QoS::AtLeastOnce, 0);
    retained.retain = true;
    dispatcher.dispatch(None, retained);
    dispatcher.sweep(Instant::now()).await;
    manager.shutdown().await.unwrap();

    assert_eq!(backend.retained_len(), 1);
    let stored = backend.get_session("durable").await.unwrap().unwrap();
    assert_eq!(stored.pending.len(), 1);
    assert_eq!(stored.subscriptions.len(), 1);
}

// Status API

#[tokio::test]
async fn status_api_lists_and_clears() {
    let broker = Broker::new(BrokerConfig::default()).unwrap();
    let dispatcher = broker.dispatcher().clone();
    let mut connect = connect_packet("b", ProtocolVersion::V5);
    connect.properties.session_expiry_interval = Some(60);
    online(&dispatcher, &connect).await;
    client(&dispatcher, "a").await;

    for topic in ["r/1", "r/2"] {
        broker
            .publish(ApplicationMessage::new(topic, "v", QoS::AtMostOnce).retain(true))
            .await
            .unwrap();
    }

    let sessions = broker.sessions();
    let ids: Vec<&str> = sessions.iter().map(|s| &*s.client_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(sessions[1].expiry_interval, 60);
    assert!(sessions[0].connected);
    assert_eq!(broker.session_count(), 2);
    assert!(broker.session_snapshot("b").is_some());

    assert_eq!(broker.retained_count(), 2);
    assert_eq!(broker.clear_retained(), 2);
    assert!(broker.retained_messages().is_empty());

    assert!(broker.delete_session("b").await);
    assert!(!broker.delete_session("b").await);
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn restore_loads_persisted_state() {
    let backend = Arc::new(MemoryBackend::new());
    {
        let manager = Arc::new(PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000));
        let broker = Broker::from_parts(BrokerConfig::default(), Arc::new(DefaultHooks), Some(manager.clone())).unwrap();
        let mut connect = connect_packet("sleeper", ProtocolVersion::V5);
        connect.clean_start = false;
        connect.properties.session_expiry_interval = Some(3600);
        let session = online(broker.dispatcher(), &connect).await;
        subscribe(broker.dispatcher(), &session, "alarm/#", QoS::AtLeastOnce).await;
        broker
            .publish(ApplicationMessage::new("alarm/set", "7:00", QoS::AtLeastOnce).retain(true))
            .await
            .unwrap();
        broker
            .dispatcher()
            .on_client_disconnected(&session, ConnectionEnd::Lost)
            .await;
        manager.shutdown().await.unwrap();
    }

    let manager = Arc::new(PersistenceManager::new(backend, Duration::from_secs(3600), 1000));
    let broker = Broker::from_parts(BrokerConfig::default(), Arc::new(DefaultHooks), Some(manager)).unwrap();
    assert_eq!(broker.restore().await.unwrap(), (1, 1));
    assert_eq!(broker.retained_count(), 1);
    assert_eq!(
        broker.dispatcher().index().client_subscriptions("sleeper").len(),
        1
    );
    assert!(!broker.sessions()[0].connected);
}

// Connections over in-memory streams

struct TestClient {
    io: DuplexStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn send(&mut self, packet: Packet) {
        let bytes = self.encoder.encode_to_bytes(&packet).unwrap();
        self.io.write_all(&bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(packet) = self.decoder.decode_buf(&mut self.buf).unwrap() {
                    return packet;
                }
                let n = self.io.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "server closed the connection");
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Wait for the server to close the stream, skipping anything it sends
    async fn closed(&mut self) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match self.io.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => self.buf.clear(),
                }
            }
        })
        .await
        .expect("connection stayed open");
    }
}

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50_000))
}

fn attach(broker: &Arc<Broker>, version: ProtocolVersion) -> (TestClient, JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let broker = broker.clone();
    let task = tokio::spawn(async move { broker.serve_stream(server, peer()).await });
    let client = TestClient {
        io: client,
        encoder: Encoder::new(version),
        decoder: Decoder::new().with_protocol_version(version),
        buf: BytesMut::new(),
    };
    (client, task)
}

async fn connected(broker: &Arc<Broker>, connect: Connect) -> (TestClient, ConnAckParts) {
    let (mut client, _) = attach(broker, connect.protocol_version);
    client.send(Packet::Connect(Box::new(connect))).await;
    match client.recv().await {
        Packet::ConnAck(ack) => (
            client,
            ConnAckParts {
                present: ack.session_present,
                reason: ack.reason_code,
                assigned: ack.properties.assigned_client_identifier,
            },
        ),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

struct ConnAckParts {
    present: bool,
    reason: ReasonCode,
    assigned: Option<String>,
}

fn broker() -> Arc<Broker> {
    Arc::new(Broker::new(BrokerConfig::default()).unwrap())
}

#[tokio::test]
async fn empty_client_id_is_assigned_on_v5() {
    let broker = broker();
    let (_client, ack) = connected(&broker, connect_packet("", ProtocolVersion::V5)).await;
    assert_eq!(ack.reason, ReasonCode::Success);
    let assigned = ack.assigned.unwrap();
    assert!(assigned.starts_with("hashmq-"));
    assert!(broker.dispatcher().is_client_connected(&assigned));
}

#[tokio::test]
async fn empty_client_id_needs_clean_start() {
    let broker = broker();
    let mut connect = connect_packet("", ProtocolVersion::V311);
    connect.clean_start = false;
    let (mut client, ack) = connected(&broker, connect).await;
    assert_eq!(ack.reason, ReasonCode::ClientIdNotValid);
    client.closed().await;
    assert_eq!(broker.session_count(), 0);
}

#[test_case::test_case("status/#" ; "multi level wildcard")]
#[test_case::test_case("status/+/temp" ; "single level wildcard")]
#[test_case::test_case("" ; "empty")]
#[tokio::test]
async fn will_topic_must_be_a_valid_topic_name(topic: &str) {
    let broker = broker();
    let mut connect = connect_packet("bad-will", ProtocolVersion::V5);
    connect.will = Some(Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: true,
        properties: Properties::default(),
    });
    let (mut client, ack) = connected(&broker, connect).await;
    assert_eq!(ack.reason, ReasonCode::TopicNameInvalid);
    client.closed().await;
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.retained_count(), 0);
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let broker = broker();
    let (mut client, task) = attach(&broker, ProtocolVersion::V5);
    client.send(Packet::PingReq).await;
    client.closed().await;
    task.await.unwrap();
}

#[tokio::test]
async fn ping_is_answered() {
    let broker = broker();
    let (mut client, _) = connected(&broker, connect_packet("pinger", ProtocolVersion::V311)).await;
    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, Packet::PingResp);
}

#[tokio::test]
async fn publish_reaches_subscriber_end_to_end() {
    let broker = broker();
    let (mut sub, _) = connected(&broker, connect_packet("sub", ProtocolVersion::V5)).await;
    let (mut publisher, _) = connected(&broker, connect_packet("pub", ProtocolVersion::V311)).await;

    sub.send(Packet::Subscribe(subscribe_packet(
        "sensors/+",
        SubscriptionOptions::with_qos(QoS::AtLeastOnce),
    )))
    .await;
    match sub.recv().await {
        Packet::SubAck(ack) => assert_eq!(ack.reason_codes, vec![ReasonCode::GrantedQoS1]),
        other => panic!("expected SUBACK, got {:?}", other),
    }

    publisher
        .send(Packet::Publish(publish("sensors/t1", "19.5", QoS::AtLeastOnce, 5)))
        .await;
    assert_eq!(publisher.recv().await, Packet::PubAck(Ack::new(5)));

    let delivered = match sub.recv().await {
        Packet::Publish(p) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    };
    assert_eq!(&*delivered.topic, "sensors/t1");
    assert_eq!(delivered.payload, "19.5");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    let id = delivered.packet_id.unwrap();
    sub.send(Packet::PubAck(Ack::new(id))).await;

    tokio::time::timeout(TIMEOUT, async {
        while broker.dispatcher().sessions().get("sub").unwrap().inflight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn takeover_closes_the_older_connection() {
    let broker = broker();
    let mut connect = connect_packet("dup", ProtocolVersion::V5);
    connect.clean_start = false;
    connect.properties.session_expiry_interval = Some(300);
    let (mut first, ack) = connected(&broker, connect.clone()).await;
    assert!(!ack.present);

    let (_second, ack) = connected(&broker, connect).await;
    assert!(ack.present);
    assert_eq!(
        first.recv().await,
        Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver))
    );
    first.closed().await;
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(broker.clients()[0].client_id.as_ref(), "dup");
}

#[tokio::test]
async fn lost_connection_publishes_will() {
    let broker = broker();
    let (mut watcher, _) = connected(&broker, connect_packet("watcher", ProtocolVersion::V5)).await;
    watcher
        .send(Packet::Subscribe(subscribe_packet(
            "wills/#",
            SubscriptionOptions::with_qos(QoS::AtMostOnce),
        )))
        .await;
    assert!(matches!(watcher.recv().await, Packet::SubAck(_)));

    let mut connect = connect_packet("fragile", ProtocolVersion::V5);
    connect.will = Some(Will {
        topic: "wills/fragile".into(),
        payload: Bytes::from_static(b"lost"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (fragile, _) = connected(&broker, connect).await;
    drop(fragile);

    match watcher.recv().await {
        Packet::Publish(p) => {
            assert_eq!(&*p.topic, "wills/fragile");
            assert_eq!(p.payload, "lost");
        }
        other => panic!("expected will, got {:?}", other),
    }
}

#[tokio::test]
async fn keep_alive_expiry_disconnects_v5_client() {
    let broker = broker();
    let mut connect = connect_packet("sleepy", ProtocolVersion::V5);
    connect.keep_alive = 1;
    let (mut client, _) = connected(&broker, connect).await;
    assert_eq!(
        client.recv().await,
        Packet::Disconnect(Disconnect::new(ReasonCode::KeepAliveTimeout))
    );
    client.closed().await;
}

#[tokio::test]
async fn administrative_disconnect_keeps_session() {
    let broker = broker();
    let mut connect = connect_packet("kept", ProtocolVersion::V5);
    connect.properties.session_expiry_interval = Some(120);
    let (mut client, _) = connected(&broker, connect).await;

    assert!(broker.disconnect_client("kept").await);
    assert_eq!(
        client.recv().await,
        Packet::Disconnect(Disconnect::new(ReasonCode::AdministrativeAction))
    );
    assert_eq!(broker.connection_count(), 0);
    assert!(!broker.sessions()[0].connected);
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let broker = broker();
    let (mut client, task) = attach(&broker, ProtocolVersion::V5);
    client
        .send(Packet::Connect(Box::new(connect_packet("c", ProtocolVersion::V5))))
        .await;
    assert!(matches!(client.recv().await, Packet::ConnAck(_)));

    broker.shutdown();
    assert_eq!(
        client.recv().await,
        Packet::Disconnect(Disconnect::new(ReasonCode::ServerShuttingDown))
    );
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
}
