//! Consumer runtime
//!
//! One runtime drains one service queue, one delivery at a time:
//!
//! 1. decode the envelope (failure → poison path, no handler runs)
//! 2. look up the handler by `event_type` (missing → ack, nothing else)
//! 3. begin a transaction and insert the idempotency marker
//!    (already seen → commit the empty transaction, ack)
//! 4. run the handler with that transaction
//! 5. success → commit, publish emitted events, ack;
//!    failure → rollback, retry/DLQ policy
//!
//! Every delivery ends in exactly one terminal action, recorded as a
//! [`DeliveryOutcome`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use event_bus::{
    read_retry_count, ConsumeOptions, DeathReason, Delivery, DeliveryStream, EventBus,
    EventEnvelope, EventPublisher, ExchangeType, FailureOutcome, QueueOptions, RetryPolicy,
    DLQ_EXCHANGE, DLQ_QUEUE, EVENTS_EXCHANGE,
};
use futures::StreamExt;
use prometheus::IntCounterVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::context::EventContext;
use crate::handler::{EventHandler, HandlerError, HandlerRegistry};
use crate::idempotency::{IdempotencyStore, MarkOutcome, ProcessedEvent};
use crate::metrics::ConsumerMetrics;
use crate::ConsumerError;

/// Terminal state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; committed and acked
    Processed,
    /// Marker already present; acked without running the handler
    Duplicate,
    /// No handler for the event type; acked
    Unrouted,
    /// Republished for another attempt; original acked
    Republished { retry_count: u32 },
    /// Parked on the DLQ; original acked
    DeadLettered { reason: DeathReason },
    /// `nack(requeue = false)`
    Dropped,
}

impl DeliveryOutcome {
    /// True if the original delivery was acked
    pub fn is_acked(&self) -> bool {
        !matches!(self, DeliveryOutcome::Dropped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Processed => "processed",
            DeliveryOutcome::Duplicate => "duplicate",
            DeliveryOutcome::Unrouted => "unrouted",
            DeliveryOutcome::Republished { .. } => "republished",
            DeliveryOutcome::DeadLettered { .. } => "dead_lettered",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureOutcome> for DeliveryOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Republished { retry_count } => {
                DeliveryOutcome::Republished { retry_count }
            }
            FailureOutcome::DeadLettered { reason } => DeliveryOutcome::DeadLettered { reason },
            FailureOutcome::Rejected => DeliveryOutcome::Dropped,
        }
    }
}

pub struct ConsumerRuntime<S: IdempotencyStore> {
    config: ConsumerConfig,
    queue: String,
    /// Consumer channel
    bus: Arc<dyn EventBus>,
    /// Separate channel for retries, DLQ parking and emitted events
    publisher: EventPublisher,
    store: Arc<S>,
    handlers: HandlerRegistry<S::Tx>,
    policy: RetryPolicy,
    metrics: Option<ConsumerMetrics>,
}

impl<S: IdempotencyStore> ConsumerRuntime<S> {
    pub fn new(
        config: ConsumerConfig,
        bus: Arc<dyn EventBus>,
        publisher: EventPublisher,
        store: Arc<S>,
    ) -> Self {
        let policy =
            RetryPolicy::new(config.max_retries).with_poison_handling(config.poison_handling);
        Self {
            queue: config.queue_name(),
            config,
            bus,
            publisher,
            store,
            handlers: HandlerRegistry::new(),
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `handler` for `event_type`; the event type becomes a binding
    pub fn register<H>(&mut self, event_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: EventHandler<S::Tx> + 'static,
    {
        self.handlers.register(event_type, Arc::new(handler));
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Registered event types plus configured extra keys, deduplicated and sorted
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.handlers.event_types().into_iter().collect();
        keys.extend(self.config.routing_keys.iter().cloned());
        keys.into_iter().collect()
    }

    /// Declare exchanges, queues and bindings; safe to repeat
    pub async fn declare_topology(&self) -> Result<(), ConsumerError> {
        let bus = self.bus.as_ref();

        bus.declare_exchange(EVENTS_EXCHANGE, ExchangeType::Topic)
            .await?;
        bus.declare_queue(&self.queue, QueueOptions::service_queue())
            .await?;
        bus.declare_exchange(DLQ_EXCHANGE, ExchangeType::Direct)
            .await?;
        bus.declare_queue(DLQ_QUEUE, QueueOptions::durable()).await?;
        bus.bind_queue(DLQ_QUEUE, DLQ_EXCHANGE, DLQ_QUEUE).await?;

        let routing_keys = self.routing_keys();
        for key in &routing_keys {
            bus.bind_queue(&self.queue, EVENTS_EXCHANGE, key).await?;
        }

        info!(
            service = %self.config.service_name,
            queue = %self.queue,
            routing_keys = ?routing_keys,
            "Consumer topology declared"
        );
        Ok(())
    }

    /// Consume until `shutdown` is cancelled or the delivery stream ends.
    ///
    /// On cancellation no new delivery is taken. The in-flight one gets
    /// `shutdown_grace` to finish; past that it is abandoned, which rolls its
    /// transaction back and leaves it unacked for the broker to redeliver.
    /// A delivery that has already reached its terminal step (commit, retry
    /// republish, DLQ parking or ack) is always let finish, so the broker never
    /// holds both the original and its retry copy.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        self.declare_topology().await?;

        let consumer_tag = format!("{}-{}", self.config.service_name, Uuid::new_v4());
        let mut deliveries = self
            .bus
            .consume(
                &self.queue,
                ConsumeOptions {
                    consumer_tag: consumer_tag.clone(),
                    prefetch: self.config.prefetch,
                },
            )
            .await?;

        info!(
            service = %self.config.service_name,
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            prefetch = self.config.prefetch,
            handlers = self.handlers.len(),
            "Consumer started"
        );

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.drive(delivery, &shutdown).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Delivery stream failed");
                    break Err(ConsumerError::Bus(e));
                }
                None => {
                    warn!(queue = %self.queue, "Delivery stream closed by broker");
                    break Err(ConsumerError::StreamClosed(self.queue.clone()));
                }
            }
        };

        self.stop(&consumer_tag, deliveries).await;
        result
    }

    async fn drive(&self, delivery: Delivery, shutdown: &CancellationToken) {
        let settling = AtomicBool::new(false);
        let work = self.process_guarded(delivery, shutdown, &settling);
        tokio::pin!(work);

        tokio::select! {
            _ = &mut work => {}
            _ = shutdown.cancelled() => {
                let grace_ms = saturating_millis(self.config.shutdown_grace);
                info!(
                    queue = %self.queue,
                    grace_ms,
                    "Shutdown requested, waiting for in-flight delivery"
                );
                if tokio::time::timeout(self.config.shutdown_grace, &mut work)
                    .await
                    .is_err()
                {
                    if settling.load(Ordering::Acquire) {
                        warn!(
                            queue = %self.queue,
                            "Grace window elapsed during settlement, letting it finish"
                        );
                        (&mut work).await;
                    } else {
                        warn!(
                            queue = %self.queue,
                            "Grace window elapsed, abandoning in-flight delivery"
                        );
                    }
                }
            }
        }
    }

    async fn stop(&self, consumer_tag: &str, deliveries: DeliveryStream) {
        if let Err(e) = self.bus.cancel(consumer_tag).await {
            warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
        }
        drop(deliveries);
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "Failed to close consumer channel");
        }
        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Run one delivery through the pipeline to its terminal action
    pub async fn process_delivery(
        &self,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> DeliveryOutcome {
        self.process_guarded(delivery, shutdown, &AtomicBool::new(false))
            .await
    }

    /// `settling` is raised once the delivery enters its terminal step
    async fn process_guarded(
        &self,
        delivery: Delivery,
        shutdown: &CancellationToken,
        settling: &AtomicBool,
    ) -> DeliveryOutcome {
        let started = Instant::now();
        let routing_key = delivery.routing_key.clone();
        let retry_count = read_retry_count(&delivery.headers);
        self.count(|m| &m.events_consumed_total, &routing_key);

        let outcome = match EventEnvelope::decode(&delivery.payload) {
            Ok(envelope) => {
                let span = info_span!(
                    "process_event",
                    event_type = %envelope.event_type,
                    client_generated_id = %envelope.client_generated_id,
                    routing_key = %routing_key,
                    retry_count,
                    queue = %self.queue,
                );
                self.dispatch(delivery, envelope, retry_count, shutdown, settling)
                    .instrument(span)
                    .await
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    routing_key = %routing_key,
                    retry_count,
                    error = %e,
                    "Envelope decode failed, handling as poison message"
                );
                self.count(|m| &m.events_failed_total, &routing_key);
                settling.store(true, Ordering::Release);
                let outcome = self
                    .policy
                    .handle_poison(self.publisher.bus().as_ref(), delivery, &e.to_string())
                    .await;
                self.record_failure(outcome, &routing_key)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .event_processing_duration_seconds
                .with_label_values(&[
                    self.config.service_name.as_str(),
                    self.queue.as_str(),
                    routing_key.as_str(),
                ])
                .observe(started.elapsed().as_secs_f64());
        }
        debug!(routing_key = %routing_key, outcome = %outcome, "Delivery settled");
        outcome
    }

    async fn dispatch(
        &self,
        delivery: Delivery,
        envelope: EventEnvelope,
        retry_count: u32,
        shutdown: &CancellationToken,
        settling: &AtomicBool,
    ) -> DeliveryOutcome {
        let routing_key = delivery.routing_key.clone();
        let settle = || settling.store(true, Ordering::Release);

        let Some(handler) = self.handlers.get(&envelope.event_type) else {
            warn!("No handler registered for event type, acking");
            self.count(|m| &m.events_unrouted_total, &routing_key);
            settle();
            self.ack(delivery).await;
            return DeliveryOutcome::Unrouted;
        };

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                settle();
                return self
                    .fail(delivery, &format!("failed to begin transaction: {}", e))
                    .await
            }
        };

        let marker = ProcessedEvent::from_envelope(&envelope);
        match self.store.check_and_mark_processed(&mut tx, &marker).await {
            Ok(MarkOutcome::Fresh) => {}
            Ok(MarkOutcome::AlreadySeen) => {
                settle();
                if let Err(e) = self.store.commit(tx).await {
                    warn!(error = %e, "Failed to commit empty dedup transaction");
                }
                info!("Event already processed, skipping");
                self.count(|m| &m.events_deduplicated_total, &routing_key);
                self.ack(delivery).await;
                return DeliveryOutcome::Duplicate;
            }
            Err(e) => {
                self.rollback(tx).await;
                settle();
                return self
                    .fail(delivery, &format!("idempotency check failed: {}", e))
                    .await;
            }
        }

        let ctx = EventContext::new(
            envelope,
            delivery.payload.clone(),
            routing_key.clone(),
            retry_count,
            delivery.redelivered,
            self.config.service_name.clone(),
            shutdown.clone(),
        );

        if let Err(e) = self.invoke(handler.as_ref(), &ctx, &mut tx).await {
            self.rollback(tx).await;
            settle();
            return self.fail(delivery, &e.to_string()).await;
        }

        // Past this point emitted events and the ack must not be cut off
        settle();
        if let Err(e) = self.store.commit(tx).await {
            return self
                .fail(delivery, &format!("failed to commit transaction: {}", e))
                .await;
        }

        self.publish_emitted(&ctx, &routing_key).await;
        self.ack(delivery).await;
        self.count(|m| &m.events_processed_total, &routing_key);
        info!("Event processed");
        DeliveryOutcome::Processed
    }

    async fn invoke(
        &self,
        handler: &dyn EventHandler<S::Tx>,
        ctx: &EventContext,
        tx: &mut S::Tx,
    ) -> Result<(), HandlerError> {
        match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(ctx, tx))
                .await
                .unwrap_or_else(|_| {
                    Err(format!("handler timed out after {}ms", limit.as_millis()).into())
                }),
            None => handler.handle(ctx, tx).await,
        }
    }

    async fn publish_emitted(&self, ctx: &EventContext, routing_key: &str) {
        for envelope in ctx.take_emitted() {
            match self.publisher.publish_envelope(&envelope).await {
                Ok(()) => debug!(
                    event_type = %envelope.event_type,
                    client_generated_id = %envelope.client_generated_id,
                    "Downstream event published"
                ),
                Err(e) => {
                    // Effects are committed; the source delivery is still acked
                    error!(
                        event_type = %envelope.event_type,
                        client_generated_id = %envelope.client_generated_id,
                        error = %e,
                        "Failed to publish downstream event after commit"
                    );
                    self.count(|m| &m.events_emit_failed_total, routing_key);
                }
            }
        }
    }

    async fn fail(&self, delivery: Delivery, error: &str) -> DeliveryOutcome {
        let routing_key = delivery.routing_key.clone();
        self.count(|m| &m.events_failed_total, &routing_key);
        let outcome = self
            .policy
            .handle_failure(self.publisher.bus().as_ref(), delivery, error)
            .await;
        self.record_failure(outcome, &routing_key)
    }

    fn record_failure(&self, outcome: FailureOutcome, routing_key: &str) -> DeliveryOutcome {
        match outcome {
            FailureOutcome::Republished { .. } => {
                self.count(|m| &m.events_retried_total, routing_key)
            }
            FailureOutcome::DeadLettered { .. } => {
                self.count(|m| &m.events_dead_lettered_total, routing_key)
            }
            FailureOutcome::Rejected => {}
        }
        outcome.into()
    }

    async fn ack(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        if let Err(e) = delivery.ack().await {
            error!(delivery_tag, error = %e, "Failed to ack delivery");
        }
    }

    async fn rollback(&self, tx: S::Tx) {
        if let Err(e) = self.store.rollback(tx).await {
            warn!(error = %e, "Failed to roll back transaction");
        }
    }

    fn count<F>(&self, counter: F, routing_key: &str)
    where
        F: Fn(&ConsumerMetrics) -> &IntCounterVec,
    {
        if let Some(metrics) = &self.metrics {
            counter(metrics)
                .with_label_values(&[self.config.service_name.as_str(), self.queue.as_str(), routing_key])
                .inc();
        }
    }
}

/// Milliseconds for log fields, pinned at `u64::MAX` for oversized durations
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
