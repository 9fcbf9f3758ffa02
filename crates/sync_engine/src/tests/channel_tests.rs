use super::*;
use crate::test_support::{change_payload, FakeTransport};
use serde_json::json;
use shared::domain::{OrganizationId, RoomId};
use std::time::Duration;
use tokio::sync::mpsc;

fn collecting_handler() -> (EventHandler, mpsc::UnboundedReceiver<RawEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: EventHandler = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<RawEvent>) -> RawEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

fn room_key(topic: Topic, room_id: RoomId) -> TopicKey {
    TopicKey {
        topic,
        filter: TopicFilter::Room(room_id),
    }
}

#[test]
fn filter_reads_new_then_old_then_top_level() {
    let room_id = RoomId::new();
    let other = RoomId::new();
    let filter = TopicFilter::Room(room_id);

    let insert = change_payload("INSERT", Some(json!({ "room_id": room_id })), None);
    assert!(filter_matches(&filter, &insert));

    let foreign = change_payload("INSERT", Some(json!({ "room_id": other })), None);
    assert!(!filter_matches(&filter, &foreign));

    let delete = change_payload("DELETE", None, Some(json!({ "room_id": room_id })));
    assert!(filter_matches(&filter, &delete));

    let presence = json!({ "event": "track", "room_id": room_id, "user_id": shared::domain::UserId::new() });
    assert!(filter_matches(&filter, &presence));

    let org_filter = TopicFilter::Organization(OrganizationId::new());
    assert!(!filter_matches(&org_filter, &json!({ "new": { "organization_id": "not-a-uuid" } })));
}

#[test]
fn filter_accepts_key_only_delete_records() {
    let filter = TopicFilter::Room(RoomId::new());
    let delete = change_payload("DELETE", None, Some(json!({ "id": RoomId::new() })));
    assert!(filter_matches(&filter, &delete));
}

#[tokio::test]
async fn delivers_only_to_matching_topic_and_filter() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    adapter.connect().await.expect("connect");

    let room_id = RoomId::new();
    let (message_handler, mut message_rx) = collecting_handler();
    let (typing_handler, mut typing_rx) = collecting_handler();
    let _messages = adapter
        .subscribe(room_key(Topic::MessageChanges, room_id), message_handler)
        .await;
    let _typing = adapter
        .subscribe(room_key(Topic::Typing, room_id), typing_handler)
        .await;

    transport.push(
        Topic::MessageChanges,
        change_payload("INSERT", Some(json!({ "room_id": RoomId::new() })), None),
    );
    let matching = change_payload("INSERT", Some(json!({ "room_id": room_id })), None);
    transport.push(Topic::MessageChanges, matching.clone());

    let event = next_event(&mut message_rx).await;
    assert_eq!(event.topic, Topic::MessageChanges);
    assert_eq!(event.payload, matching);
    assert!(message_rx.try_recv().is_err());
    assert!(typing_rx.try_recv().is_err());
    assert_eq!(transport.state().joined.len(), 2);
}

#[tokio::test]
async fn unsubscribe_stops_delivery_and_leaves_topic() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    adapter.connect().await.expect("connect");

    let room_id = RoomId::new();
    let key = room_key(Topic::MessageChanges, room_id);
    let (handler, mut rx) = collecting_handler();
    let handle = adapter.subscribe(key, handler).await;
    handle.unsubscribe().await;

    transport.push(
        Topic::MessageChanges,
        change_payload("INSERT", Some(json!({ "room_id": room_id })), None),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.state().left, vec![key]);
    assert_eq!(adapter.subscription_count(), 0);
}

#[tokio::test]
async fn topics_registered_offline_are_joined_on_connect() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    let key = room_key(Topic::Typing, RoomId::new());
    let (handler, _rx) = collecting_handler();
    let _handle = adapter.subscribe(key, handler).await;
    assert!(transport.state().joined.is_empty());

    adapter.connect().await.expect("connect");
    assert_eq!(transport.state().joined, vec![key]);
}

#[tokio::test]
async fn transport_close_is_reported_once() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    let mut lifecycle = adapter.lifecycle();
    adapter.connect().await.expect("connect");
    assert_eq!(lifecycle.recv().await.expect("opened"), ChannelLifecycle::Opened);

    transport.drop_connection("network unreachable");
    transport.drop_connection("network unreachable");

    let closed = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("in time")
        .expect("closed");
    assert_eq!(
        closed,
        ChannelLifecycle::Closed {
            reason: "network unreachable".to_string()
        }
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lifecycle.try_recv().is_err());
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn reconnect_rejoins_every_registered_topic_once() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    adapter.connect().await.expect("connect");
    let room_id = RoomId::new();
    let key = room_key(Topic::MessageChanges, room_id);
    let (first, _rx1) = collecting_handler();
    let (second, _rx2) = collecting_handler();
    let _a = adapter.subscribe(key, first).await;
    let _b = adapter.subscribe(key, second).await;
    let mut lifecycle = adapter.lifecycle();

    transport.drop_connection("reset");
    let closed = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
        .await
        .expect("in time")
        .expect("closed");
    assert!(matches!(closed, ChannelLifecycle::Closed { .. }));
    transport.state().joined.clear();
    adapter.reconnect().await.expect("reconnect");

    assert_eq!(transport.state().joined, vec![key]);
    assert!(adapter.is_connected());
}

#[tokio::test]
async fn disconnect_tears_down_all_registrations() {
    let transport = FakeTransport::new();
    let adapter = EventChannelAdapter::new(transport.clone());
    adapter.connect().await.expect("connect");
    let (handler, _rx) = collecting_handler();
    let _handle = adapter
        .subscribe(room_key(Topic::Typing, RoomId::new()), handler)
        .await;

    adapter.disconnect().await;

    assert_eq!(adapter.subscription_count(), 0);
    assert!(!adapter.is_connected());
    assert!(!transport.state().open);
}
