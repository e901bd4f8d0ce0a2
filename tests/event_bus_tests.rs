use meetmesh::{Envelope, EventBus};

#[tokio::test]
async fn test_send_reaches_every_subscriber_of_a_user() {
    let bus = EventBus::new();
    let mut first = bus.subscribe("u1").await;
    let mut second = bus.subscribe("u1").await;

    bus.send_to("u1", Envelope::notification("안내", "일정이 확정되었습니다.")).await;

    assert!(matches!(first.recv().await.unwrap(), Envelope::Notification { .. }));
    assert!(matches!(second.recv().await.unwrap(), Envelope::Notification { .. }));
}

#[tokio::test]
async fn test_messages_are_not_cross_delivered() {
    let bus = EventBus::new();
    let mut u1 = bus.subscribe("u1").await;
    let mut u2 = bus.subscribe("u2").await;

    bus.send_to("u2", Envelope::notification("안내", "u2 전용")).await;

    assert!(u2.recv().await.is_some());
    assert!(u1.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_and_connection_state() {
    let bus = EventBus::new();
    let mut u1 = bus.subscribe("u1").await;
    assert!(bus.is_connected("u1").await);
    assert!(!bus.is_connected("u2").await);

    bus.broadcast(
        &["u1".to_string(), "u2".to_string()],
        Envelope::notification("안내", "모두에게"),
    )
    .await;
    // Delivery is best-effort: the absent subscriber is simply skipped.
    assert!(u1.recv().await.is_some());
}

#[tokio::test]
async fn test_dropped_subscribers_are_pruned() {
    let bus = EventBus::new();
    let rx = bus.subscribe("u1").await;
    drop(rx);

    bus.send_to("u1", Envelope::notification("안내", "버려진 채널")).await;
    assert!(!bus.is_connected("u1").await);
}

#[tokio::test]
async fn test_envelope_wire_shape() {
    let envelope = Envelope::notification("제목", "내용");
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["type"], "notification");
    assert!(value["timestamp"].is_string());
}
