//! Broker topology shared by every service.

/// Shared topic exchange every service publishes to
pub const EVENTS_EXCHANGE: &str = "app.events";
/// Direct exchange for parked messages
pub const DLQ_EXCHANGE: &str = "app.dlq";
/// Dead-letter queue, bound to [`DLQ_EXCHANGE`] by its own name
pub const DLQ_QUEUE: &str = "app.dlq.queue";
/// Queue argument enabling single-active-consumer
pub const SINGLE_ACTIVE_CONSUMER_ARG: &str = "x-single-active-consumer";

/// Exchange types used by the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Topic,
    Direct,
}

/// Queue declaration options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub single_active_consumer: bool,
}

impl QueueOptions {
    /// Durable queue with single-active-consumer, as declared for every service queue
    pub fn service_queue() -> Self {
        Self {
            durable: true,
            single_active_consumer: true,
        }
    }

    pub fn durable() -> Self {
        Self {
            durable: true,
            single_active_consumer: false,
        }
    }
}

/// Consumer options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Channel prefetch; 0 means unbounded
    pub prefetch: u16,
}

/// Name of the per-service queue, e.g. `reminder-service.events`
pub fn service_queue_name(service: &str) -> String {
    format!("{}.events", service)
}
