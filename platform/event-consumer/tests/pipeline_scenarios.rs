//! End-to-end pipeline scenarios on the in-memory broker and store:
//! idempotent redelivery, retry escalation, recovery, unknown events,
//! poison payloads and single-active-consumer failover.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use event_bus::headers::{
    header_str, DEATH_REASON_HEADER, LAST_ERROR_HEADER, ORIGINAL_EXCHANGE_HEADER,
    ORIGINAL_ROUTING_KEY_HEADER,
};
use event_bus::{
    read_retry_count, InMemoryBus, PoisonHandling, UserId, DLQ_QUEUE, EVENTS_EXCHANGE,
};
use event_consumer::{ConsumerConfig, InMemoryIdempotencyStore};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_idempotent_redelivery_applies_effects_once() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let mut rt = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    rt.register("user.registered", ScriptedHandler::succeeding(attempts.clone()));
    let running = start(rt).await;

    let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
    let envelope = event_bus::EventEnvelope::new(
        "user.registered",
        UserId::User(Uuid::new_v4()),
        "auth-service",
        json!({"email": "a@x"}),
    )
    .with_client_generated_id(id);

    publish(&bus, &envelope).await;
    publish(&bus, &envelope).await;

    assert!(wait_until(|| store.contains(id) && settled(&bus, QUEUE)).await);
    assert_eq!(attempts.len(), 1, "handler must run once per client_generated_id");
    assert_eq!(store.processed_count(), 1);
    assert_eq!(store.rows(EFFECTS).len(), 1);
    assert_eq!(bus.queue_depth(DLQ_QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_handler_escalates_to_dlq_after_six_attempts() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let mut rt = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    rt.register("order.created", ScriptedHandler::failing(attempts.clone()));
    let running = start(rt).await;

    let envelope = envelope("order.created");
    publish(&bus, &envelope).await;

    assert!(wait_until(|| bus.queue_depth(DLQ_QUEUE) == 1 && settled(&bus, QUEUE)).await);
    assert_eq!(attempts.get(), vec![0, 1, 2, 3, 4, 5]);

    let parked = bus.queue_messages(DLQ_QUEUE);
    assert_eq!(parked.len(), 1);
    let headers = &parked[0].headers;
    assert_eq!(header_str(headers, ORIGINAL_ROUTING_KEY_HEADER), Some("order.created"));
    assert_eq!(header_str(headers, ORIGINAL_EXCHANGE_HEADER), Some(EVENTS_EXCHANGE));
    assert_eq!(header_str(headers, DEATH_REASON_HEADER), Some("max-retries-exceeded"));
    assert_eq!(header_str(headers, LAST_ERROR_HEADER), Some("attempt 5 failed"));
    assert_eq!(read_retry_count(headers), 5);
    // Body travels verbatim
    assert_eq!(parked[0].payload, envelope.encode().unwrap());

    assert!(!store.contains(envelope.client_generated_id));
    assert!(store.rows(EFFECTS).is_empty());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_recover_without_dlq() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let mut rt = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    rt.register(
        "video.processed",
        ScriptedHandler {
            succeed_from: Some(3),
            ..ScriptedHandler::succeeding(attempts.clone())
        },
    );
    let running = start(rt).await;

    let envelope = envelope("video.processed");
    publish(&bus, &envelope).await;

    assert!(wait_until(|| store.contains(envelope.client_generated_id) && settled(&bus, QUEUE)).await);
    assert_eq!(attempts.get(), vec![0, 1, 2, 3]);
    assert_eq!(store.rows(EFFECTS).len(), 1);
    assert_eq!(bus.queue_depth(DLQ_QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_event_type_is_acked_without_side_effects() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let config = ConsumerConfig::new(SERVICE).with_routing_key("ghost.event");
    let mut rt = runtime(&bus, &store, config);
    rt.register("user.registered", ScriptedHandler::succeeding(attempts.clone()));
    let running = start(rt).await;

    publish(&bus, &envelope("ghost.event")).await;

    // Follow with a known event so the ghost has certainly been handled first
    let marker = envelope("user.registered");
    publish(&bus, &marker).await;

    assert!(wait_until(|| store.contains(marker.client_generated_id) && settled(&bus, QUEUE)).await);
    assert_eq!(attempts.len(), 1);
    assert_eq!(store.processed_count(), 1);
    assert_eq!(bus.queue_depth(DLQ_QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_poison_payload_goes_to_dlq_once() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let mut rt = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    rt.register("user.registered", ScriptedHandler::succeeding(attempts.clone()));
    let running = start(rt).await;

    publish_raw(&bus, "user.registered", b"definitely not json").await;

    assert!(wait_until(|| bus.queue_depth(DLQ_QUEUE) == 1 && settled(&bus, QUEUE)).await);
    // Give a stray retry the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bus.queue_depth(DLQ_QUEUE), 1);
    assert!(attempts.get().is_empty());
    assert_eq!(store.processed_count(), 0);

    let parked = bus.queue_messages(DLQ_QUEUE);
    assert_eq!(header_str(&parked[0].headers, DEATH_REASON_HEADER), Some("decode-failed"));
    assert_eq!(parked[0].payload, b"definitely not json");
    assert_eq!(read_retry_count(&parked[0].headers), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_poison_payload_rejected_when_configured() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts = Attempts::default();

    let config = ConsumerConfig::new(SERVICE).with_poison_handling(PoisonHandling::Reject);
    let mut rt = runtime(&bus, &store, config);
    rt.register("user.registered", ScriptedHandler::succeeding(attempts.clone()));
    let running = start(rt).await;

    publish_raw(&bus, "user.registered", br#"{"event_type": "user.registered"}"#).await;

    assert!(wait_until(|| settled(&bus, QUEUE)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(settled(&bus, QUEUE));
    assert_eq!(bus.queue_depth(DLQ_QUEUE), 0);
    assert!(attempts.get().is_empty());
    assert_eq!(store.processed_count(), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_active_consumer_failover_without_duplicates() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let attempts_a = Attempts::default();
    let attempts_b = Attempts::default();

    let mut replica_a = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    replica_a.register(
        "user.registered",
        ScriptedHandler {
            label: "a",
            delay: Duration::from_millis(50),
            ..ScriptedHandler::succeeding(attempts_a.clone())
        },
    );
    let running_a = start(replica_a).await;
    assert!(wait_until(|| bus.consumer_count(QUEUE) == 1).await);

    let mut replica_b = runtime(&bus, &store, ConsumerConfig::new(SERVICE));
    replica_b.register(
        "user.registered",
        ScriptedHandler {
            label: "b",
            ..ScriptedHandler::succeeding(attempts_b.clone())
        },
    );
    let running_b = start(replica_b).await;
    assert!(wait_until(|| bus.consumer_count(QUEUE) == 2).await);

    let envelopes: Vec<_> = (0..10).map(|_| envelope("user.registered")).collect();
    for envelope in &envelopes {
        publish(&bus, envelope).await;
    }

    assert!(wait_until(|| attempts_a.len() >= 2).await);
    assert!(attempts_b.get().is_empty(), "standby replica must not receive while A is active");

    // A goes away mid-queue; its buffered deliveries return to the queue for B
    running_a.stop().await.unwrap();

    assert!(wait_until(|| store.processed_count() == envelopes.len() && settled(&bus, QUEUE)).await);
    assert!(!attempts_b.get().is_empty());

    let rows = store.rows(EFFECTS);
    assert_eq!(rows.len(), envelopes.len());
    let distinct: HashSet<String> = rows
        .iter()
        .map(|row| row["client_generated_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(distinct.len(), envelopes.len(), "no side effect may be applied twice");

    running_b.stop().await.unwrap();
}
