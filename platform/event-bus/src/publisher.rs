//! Publisher for the shared events exchange.
//!
//! Declares the topic exchange on first use, then publishes persistent JSON
//! messages. The publisher is a thin adapter: a failed publish is returned to the
//! caller, never retried here.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::envelope::EventEnvelope;
use crate::topology::ExchangeType;
use crate::{BusError, BusMessage, BusResult, EventBus};

#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    exchange: String,
    declared: Arc<OnceCell<()>>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, exchange: impl Into<String>) -> Self {
        Self {
            bus,
            exchange: exchange.into(),
            declared: Arc::new(OnceCell::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Declare the exchange; later calls are no-ops once one succeeds
    pub async fn declare(&self) -> BusResult<()> {
        self.declared
            .get_or_try_init(|| async {
                self.bus
                    .declare_exchange(&self.exchange, ExchangeType::Topic)
                    .await
            })
            .await
            .map(|_| ())
    }

    /// Publish any serializable payload under `routing_key`
    pub async fn publish<T: Serialize + ?Sized>(&self, routing_key: &str, payload: &T) -> BusResult<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        self.publish_message(BusMessage::new(routing_key, body)).await
    }

    /// Publish an envelope; its `event_type` is the routing key
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> BusResult<()> {
        let body = envelope
            .encode()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        debug!(
            event_type = %envelope.event_type,
            client_generated_id = %envelope.client_generated_id,
            exchange = %self.exchange,
            "Publishing event"
        );
        self.publish_message(BusMessage::new(envelope.event_type.clone(), body))
            .await
    }

    /// Publish an envelope with an explicit routing key, which must equal `event_type`
    pub async fn publish_envelope_as(
        &self,
        routing_key: &str,
        envelope: &EventEnvelope,
    ) -> BusResult<()> {
        if routing_key != envelope.event_type {
            return Err(BusError::RoutingKeyMismatch {
                event_type: envelope.event_type.clone(),
                routing_key: routing_key.to_string(),
            });
        }
        self.publish_envelope(envelope).await
    }

    /// Publish a prepared message (headers included) to this publisher's exchange
    pub async fn publish_message(&self, message: BusMessage) -> BusResult<()> {
        self.declare().await?;
        self.bus.publish(&self.exchange, message).await
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("exchange", &self.exchange)
            .field("declared", &self.declared.initialized())
            .finish()
    }
}
