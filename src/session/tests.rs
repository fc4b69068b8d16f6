use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pretty_assertions::assert_eq;

use super::*;
use crate::events::testing::RecordingEvents;
use crate::events::BrokerEvent;
use crate::protocol::{Ack, Classification, Packet, ProtocolVersion, Publish, QoS, ReasonCode};

const TIMEOUT: Duration = Duration::from_secs(5);

fn session_with(
    max_pending: usize,
    strategy: OverflowStrategy,
) -> (Session, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::default());
    let session = Session::new(
        "client-1",
        ProtocolVersion::V5,
        SessionLimits {
            max_pending_messages: max_pending,
            overflow_strategy: strategy,
        },
        events.clone(),
    );
    (session, events)
}

fn publish(topic: &str, payload: &'static str, qos: QoS) -> Publish {
    Publish::new(topic, Bytes::from_static(payload.as_bytes()), qos)
}

fn payload_of(item: BusItem) -> Bytes {
    match item.complete(Completion::Delivered) {
        Packet::Publish(p) => p.payload,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

fn overwritten_count(events: &[BrokerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BrokerEvent::MessageOverwritten { .. }))
        .count()
}

#[test]
fn drop_oldest_keeps_newest_messages() {
    let (session, events) = session_with(2, OverflowStrategy::DropOldestQueuedMessage);
    let mut a = session
        .enqueue_publish(publish("t", "A", QoS::AtMostOnce))
        .unwrap();
    session.enqueue_publish(publish("t", "B", QoS::AtMostOnce)).unwrap();
    session.enqueue_publish(publish("t", "C", QoS::AtMostOnce)).unwrap();

    assert_eq!(a.try_result(), Some(Completion::Overwritten));
    assert_eq!(payload_of(session.bus().try_dequeue().unwrap()), "B");
    assert_eq!(payload_of(session.bus().try_dequeue().unwrap()), "C");
    assert!(session.bus().try_dequeue().is_none());
    assert_eq!(overwritten_count(&events.take()), 1);
}

#[test]
fn drop_new_rejects_incoming_message() {
    let (session, events) = session_with(2, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "A", QoS::AtLeastOnce)).unwrap();
    session.enqueue_publish(publish("t", "B", QoS::AtLeastOnce)).unwrap();
    let mut c = session
        .enqueue_publish(publish("t", "C", QoS::AtLeastOnce))
        .unwrap();

    assert_eq!(c.try_result(), Some(Completion::Dropped));
    // the rejected message's packet id went straight back
    assert_eq!(session.inflight_count(), 2);
    let dropped = events
        .take()
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::MessageDropped { .. }))
        .count();
    assert_eq!(dropped, 1);
}

#[test]
fn overwritten_qos2_message_releases_its_packet_id() {
    let (session, _) = session_with(1, OverflowStrategy::DropOldestQueuedMessage);
    session.enqueue_publish(publish("t", "A", QoS::ExactlyOnce)).unwrap();
    session.enqueue_publish(publish("t", "B", QoS::ExactlyOnce)).unwrap();

    assert_eq!(session.inflight_count(), 1);
    let item = session.bus().try_dequeue().unwrap();
    let id = item.packet.packet_id().unwrap();
    assert_eq!(session.inflight().get(id).unwrap().publish.payload, "B");
}

#[test]
fn qos0_message_evicting_a_qos1_message_releases_its_packet_id() {
    let (session, events) = session_with(1, OverflowStrategy::DropOldestQueuedMessage);
    let mut a = session
        .enqueue_publish(publish("t", "A", QoS::AtLeastOnce))
        .unwrap();
    session.enqueue_publish(publish("t", "B", QoS::AtMostOnce)).unwrap();

    assert_eq!(a.try_result(), Some(Completion::Overwritten));
    assert_eq!(session.inflight_count(), 0);
    assert_eq!(payload_of(session.bus().try_dequeue().unwrap()), "B");
    // nothing left to resend on reconnect
    assert_eq!(session.replay_inflight(), 0);
    assert!(session.bus().try_dequeue().is_none());
    assert_eq!(overwritten_count(&events.take()), 1);
}

#[test]
fn control_packets_bypass_the_data_bound() {
    let (session, _) = session_with(1, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "A", QoS::AtMostOnce)).unwrap();
    for id in 1..=5 {
        session.enqueue_control(Packet::PubAck(Ack::new(id)));
    }
    assert_eq!(session.bus().len(), 6);
}

#[test]
fn dequeue_prefers_health_then_control() {
    let bus = PacketBus::new(10, OverflowStrategy::DropNewMessage);
    bus.enqueue(Packet::Publish(publish("t", "1", QoS::AtMostOnce)), Partition::Data);
    bus.enqueue(Packet::Publish(publish("t", "2", QoS::AtMostOnce)), Partition::Data);
    bus.enqueue(Packet::PubAck(Ack::new(1)), Partition::Control);
    bus.enqueue(Packet::PingResp, Partition::Health);

    let order: Vec<Packet> = std::iter::from_fn(|| bus.try_dequeue())
        .map(|item| item.complete(Completion::Delivered))
        .collect();
    assert_eq!(
        order,
        vec![
            Packet::PingResp,
            Packet::PubAck(Ack::new(1)),
            Packet::Publish(publish("t", "1", QoS::AtMostOnce)),
            Packet::Publish(publish("t", "2", QoS::AtMostOnce)),
        ]
    );
}

#[tokio::test]
async fn closing_the_bus_abandons_queued_items() {
    let bus = PacketBus::new(10, OverflowStrategy::DropNewMessage);
    let receipt = bus
        .enqueue(Packet::PingResp, Partition::Health)
        .receipt;
    bus.close();
    assert_eq!(receipt.wait().await, Completion::Abandoned);
    assert!(bus.dequeue().await.is_none());

    let late = bus.enqueue(Packet::PingResp, Partition::Health).receipt;
    assert_eq!(late.wait().await, Completion::Abandoned);
}

#[tokio::test]
async fn dequeue_wakes_on_enqueue() {
    let bus = Arc::new(PacketBus::new(10, OverflowStrategy::DropNewMessage));
    let consumer = tokio::spawn({
        let bus = bus.clone();
        async move { bus.dequeue().await.map(|item| item.complete(Completion::Delivered)) }
    });
    tokio::task::yield_now().await;
    let receipt = bus.enqueue(Packet::PingResp, Partition::Health).receipt;

    assert_eq!(consumer.await.unwrap(), Some(Packet::PingResp));
    assert_eq!(receipt.wait().await, Completion::Delivered);
}

#[test]
fn qos1_retransmits_with_dup_until_acknowledged() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::AtLeastOnce)).unwrap();

    // first delivery is written and then lost
    let first = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    let sent_at = Instant::now();
    session.on_packet_written(&first, sent_at);
    let Packet::Publish(ref first) = first else {
        panic!("expected PUBLISH");
    };
    assert!(!first.dup);
    let id = first.packet_id.unwrap();

    assert_eq!(session.retry_expired(sent_at, TIMEOUT, 3).unwrap(), 0);
    assert_eq!(session.retry_expired(sent_at + TIMEOUT, TIMEOUT, 3).unwrap(), 1);

    let retry = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    let Packet::Publish(retry) = retry else {
        panic!("expected PUBLISH");
    };
    assert!(retry.dup);
    assert_eq!(retry.packet_id, Some(id));

    assert_eq!(session.on_puback(id), AckMatch::Matched);
    assert_eq!(session.inflight_count(), 0);
    assert_eq!(session.on_puback(id), AckMatch::Unknown);
}

#[test]
fn exhausted_retries_fail_the_session() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::AtLeastOnce)).unwrap();
    let mut now = Instant::now();

    for _ in 0..2 {
        let packet = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
        session.on_packet_written(&packet, now);
        now += TIMEOUT;
        assert_eq!(session.retry_expired(now, TIMEOUT, 2).unwrap(), 1);
    }
    let packet = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    session.on_packet_written(&packet, now);

    let err = session.retry_expired(now + TIMEOUT, TIMEOUT, 2).unwrap_err();
    assert_eq!(err.classification(), Classification::SessionFailure);
}

#[test]
fn queued_messages_are_not_retried() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::AtLeastOnce)).unwrap();
    let later = Instant::now() + TIMEOUT * 10;
    assert_eq!(session.retry_expired(later, TIMEOUT, 1).unwrap(), 0);
}

#[test]
fn qos2_outbound_handshake() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::ExactlyOnce)).unwrap();
    let packet = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    let now = Instant::now();
    session.on_packet_written(&packet, now);
    let id = packet.packet_id().unwrap();

    // PUBCOMP before PUBREC is out of order
    assert_eq!(
        session.on_pubcomp(id),
        AckMatch::WrongState(AwaitedAck::PubRec)
    );

    let pubrel = session.on_pubrec(id, ReasonCode::Success).unwrap();
    assert_eq!(pubrel, Ack::new(id));
    session.enqueue_control(Packet::PubRel(pubrel));
    let written = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    session.on_packet_written(&written, now);

    // lost PUBCOMP: the PUBREL is resent, not the PUBLISH
    session.retry_expired(now + TIMEOUT, TIMEOUT, 3).unwrap();
    let resent = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    assert_eq!(resent, Packet::PubRel(Ack::new(id)));

    assert_eq!(session.on_pubcomp(id), AckMatch::Matched);
    assert!(session.inflight().is_empty());
}

#[test]
fn pubrec_error_fails_and_releases_id() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::ExactlyOnce)).unwrap();
    let id = session.bus().try_dequeue().unwrap().packet.packet_id().unwrap();

    let err = session
        .on_pubrec(id, ReasonCode::PacketIdInUse)
        .unwrap_err();
    assert_eq!(err.classification(), Classification::SessionFailure);
    assert_eq!(session.inflight_count(), 0);
}

#[test]
fn unknown_pubrec_answers_packet_id_not_found() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    let pubrel = session.on_pubrec(77, ReasonCode::Success).unwrap();
    assert_eq!(pubrel.reason_code, ReasonCode::PacketIdNotFound);
}

#[test]
fn inbound_qos2_is_delivered_once() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    assert!(session.on_inbound_qos2(5));
    assert!(!session.on_inbound_qos2(5), "retransmission is suppressed");

    assert_eq!(session.on_pubrel(5), Ack::new(5));
    assert_eq!(
        session.on_pubrel(5).reason_code,
        ReasonCode::PacketIdNotFound
    );
    assert!(session.on_inbound_qos2(5), "id reusable after PUBCOMP");
}

#[test]
fn allocator_skips_ids_in_use_and_reports_exhaustion() {
    let mut table = InflightTable::new();
    assert!(table.track_inbound(1));
    assert_eq!(table.allocate().unwrap(), 2);

    for id in 1..=u16::MAX {
        table.track_inbound(id);
    }
    let err = table.allocate().unwrap_err();
    assert_eq!(err.classification(), Classification::SessionFailure);
}

#[test]
fn allocator_wraps_to_one() {
    let mut table = InflightTable::new();
    for _ in 0..u16::MAX {
        table.allocate().unwrap();
    }
    assert_eq!(table.allocate().unwrap(), 1);
}

#[test]
fn replay_after_reconnect_marks_publish_dup() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "m", QoS::AtLeastOnce)).unwrap();
    let first = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    session.on_packet_written(&first, Instant::now());

    assert_eq!(session.replay_inflight(), 1);
    let Packet::Publish(replayed) = session.bus().try_dequeue().unwrap().packet else {
        panic!("expected PUBLISH");
    };
    assert!(replayed.dup);
    assert_eq!(replayed.packet_id, first.packet_id());
}

#[test]
fn expiry_depends_on_interval_and_connection() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    let now = Instant::now();
    session.mark_connected();
    assert!(!session.is_expired(now));

    session.state_mut().expiry_interval = 10;
    session.mark_disconnected(now);
    assert!(!session.is_expired(now + Duration::from_secs(9)));
    assert!(session.is_expired(now + Duration::from_secs(10)));

    session.state_mut().expiry_interval = EXPIRY_NEVER;
    assert!(!session.is_expired(now + Duration::from_secs(1_000_000)));
}

#[test]
fn items_bag() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    assert_eq!(session.set_item("k", Bytes::from_static(b"v")), None);
    assert_eq!(session.item("k"), Some(Bytes::from_static(b"v")));
    assert_eq!(session.remove_item("k"), Some(Bytes::from_static(b"v")));
    assert_eq!(session.item("k"), None);
}

#[test]
fn store_removes_only_the_same_session() {
    let store = SessionStore::new();
    let (old, _) = session_with(1, OverflowStrategy::DropNewMessage);
    let old = Arc::new(old);
    store.insert(old.clone());
    let (new, _) = session_with(1, OverflowStrategy::DropNewMessage);
    let new = Arc::new(new);
    assert!(store.insert(new.clone()).is_some());

    assert!(!store.remove_if_same(&old));
    assert_eq!(store.len(), 1);
    assert!(store.remove_if_same(&new));
    assert!(store.is_empty());
}

#[test]
fn overflow_strategy_parses_config_spellings() {
    assert_eq!(
        "drop_oldest_queued_message".parse::<OverflowStrategy>(),
        Ok(OverflowStrategy::DropOldestQueuedMessage)
    );
    assert_eq!(
        "drop-new".parse::<OverflowStrategy>(),
        Ok(OverflowStrategy::DropNewMessage)
    );
    assert!("drop_random".parse::<OverflowStrategy>().is_err());
}

#[test]
fn replay_skips_messages_still_queued() {
    let (session, _) = session_with(10, OverflowStrategy::DropNewMessage);
    session.enqueue_publish(publish("t", "sent", QoS::AtLeastOnce)).unwrap();
    session.enqueue_publish(publish("t", "queued", QoS::AtLeastOnce)).unwrap();
    let first = session.bus().try_dequeue().unwrap().complete(Completion::Delivered);
    session.on_packet_written(&first, Instant::now());
    session.enqueue_control(Packet::PubAck(Ack::new(9)));

    assert_eq!(session.detach(), 1);
    assert_eq!(session.replay_inflight(), 1);

    let mut payloads = Vec::new();
    while let Some(item) = session.bus().try_dequeue() {
        payloads.push(payload_of(item));
    }
    payloads.sort();
    assert_eq!(payloads, vec![Bytes::from_static(b"queued"), Bytes::from_static(b"sent")]);
}
