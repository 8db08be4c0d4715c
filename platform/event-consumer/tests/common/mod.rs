//! Shared harness for consumer pipeline tests on the in-memory broker and store.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use event_bus::{
    BusError, BusMessage, BusResult, ConsumeOptions, DeliveryStream, EventBus, EventEnvelope,
    EventPublisher, ExchangeType, InMemoryBus, QueueOptions, UserId, EVENTS_EXCHANGE,
};
use event_consumer::{
    ConsumerConfig, ConsumerError, ConsumerRuntime, EventContext, EventHandler, HandlerError,
    InMemoryIdempotencyStore, InMemoryTx,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SERVICE: &str = "reminder-service";
pub const QUEUE: &str = "reminder-service.events";
pub const EFFECTS: &str = "effects";

pub type Runtime = ConsumerRuntime<InMemoryIdempotencyStore>;

/// Runtime on its own consumer and publisher channels of `bus`
pub fn runtime(bus: &InMemoryBus, store: &Arc<InMemoryIdempotencyStore>, config: ConsumerConfig) -> Runtime {
    let publisher = EventPublisher::new(Arc::new(bus.channel()), EVENTS_EXCHANGE);
    ConsumerRuntime::new(config, Arc::new(bus.channel()), publisher, Arc::clone(store))
}

pub fn runtime_with_publisher(
    bus: &InMemoryBus,
    store: &Arc<InMemoryIdempotencyStore>,
    config: ConsumerConfig,
    publisher_bus: Arc<dyn EventBus>,
) -> Runtime {
    let publisher = EventPublisher::new(publisher_bus, EVENTS_EXCHANGE);
    ConsumerRuntime::new(config, Arc::new(bus.channel()), publisher, Arc::clone(store))
}

pub struct Running {
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), ConsumerError>>,
}

impl Running {
    pub async fn stop(self) -> Result<(), ConsumerError> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("runtime did not stop")
            .expect("runtime task panicked")
    }
}

/// Declare topology, then run the runtime in the background
pub async fn start(runtime: Runtime) -> Running {
    runtime.declare_topology().await.unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { runtime.run(token).await });
    Running { shutdown, handle }
}

pub fn envelope(event_type: &str) -> EventEnvelope {
    EventEnvelope::new(
        event_type,
        UserId::User(Uuid::new_v4()),
        "test-producer",
        json!({"email": "a@x"}),
    )
}

pub async fn publish(bus: &InMemoryBus, envelope: &EventEnvelope) {
    bus.publish(
        EVENTS_EXCHANGE,
        BusMessage::new(envelope.event_type.clone(), envelope.encode().unwrap()),
    )
    .await
    .unwrap();
}

pub async fn publish_raw(bus: &InMemoryBus, routing_key: &str, body: &[u8]) {
    bus.publish(EVENTS_EXCHANGE, BusMessage::new(routing_key, body.to_vec()))
        .await
        .unwrap();
}

/// Poll `condition` every 10ms for up to 5s
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn settled(bus: &InMemoryBus, queue: &str) -> bool {
    bus.queue_depth(queue) == 0 && bus.unacked_count(queue) == 0
}

/// Bind a catch-all inspection queue for emitted events
pub async fn sink(bus: &InMemoryBus, name: &str, routing_key: &str) {
    bus.declare_exchange(EVENTS_EXCHANGE, ExchangeType::Topic)
        .await
        .unwrap();
    bus.declare_queue(name, QueueOptions::durable()).await.unwrap();
    bus.bind_queue(name, EVENTS_EXCHANGE, routing_key)
        .await
        .unwrap();
}

/// Retry counts seen by a handler, in order
#[derive(Clone, Default)]
pub struct Attempts(Arc<Mutex<Vec<u32>>>);

impl Attempts {
    pub fn push(&self, retry_count: u32) {
        self.0.lock().unwrap().push(retry_count);
    }

    pub fn get(&self) -> Vec<u32> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Fails until `x-retry-count` reaches `succeed_from`; `None` fails forever.
/// A successful attempt writes one row to [`EFFECTS`].
pub struct ScriptedHandler {
    pub attempts: Attempts,
    pub succeed_from: Option<u32>,
    pub label: &'static str,
    pub delay: Duration,
}

impl ScriptedHandler {
    pub fn succeeding(attempts: Attempts) -> Self {
        Self {
            attempts,
            succeed_from: Some(0),
            label: "default",
            delay: Duration::ZERO,
        }
    }

    pub fn failing(attempts: Attempts) -> Self {
        Self {
            succeed_from: None,
            ..Self::succeeding(attempts)
        }
    }
}

#[async_trait]
impl EventHandler<InMemoryTx> for ScriptedHandler {
    async fn handle(&self, ctx: &EventContext, tx: &mut InMemoryTx) -> Result<(), HandlerError> {
        self.attempts.push(ctx.retry_count());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.succeed_from {
            Some(from) if ctx.retry_count() >= from => {
                tx.insert_row(
                    EFFECTS,
                    json!({
                        "client_generated_id": ctx.envelope().client_generated_id,
                        "handled_by": self.label,
                    }),
                );
                Ok(())
            }
            _ => Err(format!("attempt {} failed", ctx.retry_count()).into()),
        }
    }
}

/// Delegates to an in-memory channel but refuses to publish `refused_key`
pub struct RefusingBus {
    pub inner: InMemoryBus,
    pub refused_key: String,
}

#[async_trait]
impl EventBus for RefusingBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BusResult<()> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<()> {
        self.inner.declare_queue(name, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        if message.routing_key == self.refused_key {
            return Err(BusError::PublishError("channel closed".into()));
        }
        self.inner.publish(exchange, message).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream> {
        self.inner.consume(queue, options).await
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.inner.cancel(consumer_tag).await
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.close().await
    }
}

/// Delegates to an in-memory channel; each publish lands at once but its
/// confirm takes `confirm_delay` to come back
pub struct SlowConfirmBus {
    pub inner: InMemoryBus,
    pub confirm_delay: Duration,
}

#[async_trait]
impl EventBus for SlowConfirmBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BusResult<()> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<()> {
        self.inner.declare_queue(name, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        self.inner.publish(exchange, message).await?;
        tokio::time::sleep(self.confirm_delay).await;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream> {
        self.inner.consume(queue, options).await
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.inner.cancel(consumer_tag).await
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.close().await
    }
}
