//! Consumer retry policy with dead-lettering
//!
//! A failed delivery is never requeued through the broker. It is republished to
//! its original exchange and routing key with `x-retry-count` incremented, so the
//! attempt number stays observable, and the original is acked. Once the budget
//! is spent the body is parked on `app.dlq.queue` with the reason in headers.
//!
//! Every path ends in exactly one `ack` or `nack` of the original delivery.

use std::fmt;
use std::str::FromStr;

use tracing::{error, warn};

use crate::headers::{
    read_retry_count, with_incremented_retry_count, HeaderValue, DEATH_REASON_HEADER,
    LAST_ERROR_HEADER, ORIGINAL_EXCHANGE_HEADER, ORIGINAL_ROUTING_KEY_HEADER,
};
use crate::topology::{DLQ_EXCHANGE, DLQ_QUEUE};
use crate::{BusMessage, Delivery, EventBus};

/// Default retry budget: six attempts in total
pub const MAX_RETRIES: u32 = 5;

const MAX_ERROR_HEADER_LEN: usize = 512;

/// Why a message was parked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    MaxRetriesExceeded,
    DecodeFailed,
}

impl DeathReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathReason::MaxRetriesExceeded => "max-retries-exceeded",
            DeathReason::DecodeFailed => "decode-failed",
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a body that is not a valid envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonHandling {
    /// Publish to the DLQ with `x-death-reason = decode-failed`, then ack
    #[default]
    DeadLetter,
    /// `nack(requeue = false)`; the broker's own dead-lettering applies, if any
    Reject,
}

impl FromStr for PoisonHandling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dead-letter" | "dlq" => Ok(PoisonHandling::DeadLetter),
            "reject" | "nack" => Ok(PoisonHandling::Reject),
            other => Err(format!("unknown poison handling '{}'", other)),
        }
    }
}

/// Terminal action taken for a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Republished with this `x-retry-count`; original acked
    Republished { retry_count: u32 },
    /// Parked on the DLQ; original acked
    DeadLettered { reason: DeathReason },
    /// `nack(requeue = false)`
    Rejected,
}

/// Bounded-retry and dead-letter policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    dlq_exchange: String,
    dlq_routing_key: String,
    poison: PoisonHandling,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_RETRIES)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            dlq_exchange: DLQ_EXCHANGE.to_string(),
            dlq_routing_key: DLQ_QUEUE.to_string(),
            poison: PoisonHandling::default(),
        }
    }

    pub fn with_poison_handling(mut self, poison: PoisonHandling) -> Self {
        self.poison = poison;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn poison_handling(&self) -> PoisonHandling {
        self.poison
    }

    /// Handle a handler failure for `delivery`
    ///
    /// # Arguments
    /// * `bus` - publisher-side channel used for the republish or DLQ publish
    /// * `delivery` - the original delivery; consumed by its terminal ack/nack
    /// * `error` - handler error text, recorded on dead-lettered copies
    pub async fn handle_failure(
        &self,
        bus: &dyn EventBus,
        delivery: Delivery,
        error: &str,
    ) -> FailureOutcome {
        let retry_count = read_retry_count(&delivery.headers);

        if retry_count >= self.max_retries {
            return self
                .dead_letter(bus, delivery, DeathReason::MaxRetriesExceeded, error)
                .await;
        }

        let next = retry_count.saturating_add(1);
        let message = BusMessage::new(delivery.routing_key.clone(), delivery.payload.clone())
            .with_headers(with_incremented_retry_count(&delivery.headers));

        match bus.publish(&delivery.exchange, message).await {
            Ok(()) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    retry_count = next,
                    max_retries = self.max_retries,
                    error = %error,
                    "Event processing failed, republished for retry"
                );
                settle_ack(delivery).await;
                FailureOutcome::Republished { retry_count: next }
            }
            Err(e) => {
                error!(
                    routing_key = %delivery.routing_key,
                    retry_count = retry_count,
                    error = %e,
                    "Retry republish failed, rejecting delivery without requeue"
                );
                reject(delivery).await
            }
        }
    }

    /// Handle a body that could not be decoded; never retried
    pub async fn handle_poison(
        &self,
        bus: &dyn EventBus,
        delivery: Delivery,
        error: &str,
    ) -> FailureOutcome {
        match self.poison {
            PoisonHandling::DeadLetter => {
                self.dead_letter(bus, delivery, DeathReason::DecodeFailed, error)
                    .await
            }
            PoisonHandling::Reject => {
                error!(
                    routing_key = %delivery.routing_key,
                    error = %error,
                    "Poison message rejected without requeue"
                );
                reject(delivery).await
            }
        }
    }

    async fn dead_letter(
        &self,
        bus: &dyn EventBus,
        delivery: Delivery,
        reason: DeathReason,
        error: &str,
    ) -> FailureOutcome {
        let mut headers = delivery.headers.clone();
        headers.insert(
            ORIGINAL_EXCHANGE_HEADER.to_string(),
            HeaderValue::from(delivery.exchange.as_str()),
        );
        headers.insert(
            ORIGINAL_ROUTING_KEY_HEADER.to_string(),
            HeaderValue::from(delivery.routing_key.as_str()),
        );
        headers.insert(DEATH_REASON_HEADER.to_string(), HeaderValue::from(reason.as_str()));
        headers.insert(
            LAST_ERROR_HEADER.to_string(),
            HeaderValue::from(truncate(error, MAX_ERROR_HEADER_LEN)),
        );

        let message = BusMessage::new(self.dlq_routing_key.clone(), delivery.payload.clone())
            .with_headers(headers);

        match bus.publish(&self.dlq_exchange, message).await {
            Ok(()) => {
                error!(
                    routing_key = %delivery.routing_key,
                    retry_count = read_retry_count(&delivery.headers),
                    reason = %reason,
                    error = %error,
                    "Event moved to DLQ"
                );
                settle_ack(delivery).await;
                FailureOutcome::DeadLettered { reason }
            }
            Err(e) => {
                error!(
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    error = %e,
                    "DLQ publish failed, rejecting delivery without requeue"
                );
                reject(delivery).await
            }
        }
    }
}

async fn settle_ack(delivery: Delivery) {
    let routing_key = delivery.routing_key.clone();
    if let Err(e) = delivery.ack().await {
        // The copy is already published; a redelivery of the original is absorbed by idempotency
        error!(routing_key = %routing_key, error = %e, "Failed to ack original delivery");
    }
}

async fn reject(delivery: Delivery) -> FailureOutcome {
    let routing_key = delivery.routing_key.clone();
    if let Err(e) = delivery.nack(false).await {
        error!(routing_key = %routing_key, error = %e, "Failed to nack delivery");
    }
    FailureOutcome::Rejected
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or(s)
}
