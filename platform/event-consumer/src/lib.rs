//! # Event Consumer
//!
//! Consumer-side half of the event fabric: everything a service needs to
//! drain its `<service>.events` queue with at-most-once effects.
//!
//! - [`ConsumerRuntime`]: decode → dedup → dispatch → commit → ack pipeline
//! - [`IdempotencyStore`]: transactional marker store (PostgreSQL or in-memory)
//! - [`AdvisoryLock`] / [`with_lock`]: key-scoped PostgreSQL advisory locks
//! - [`EventHandler`] / [`EventContext`]: what handlers implement and receive
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use event_bus::{AmqpBus, EventPublisher, EVENTS_EXCHANGE};
//! use event_consumer::{ConsumerConfig, ConsumerRuntime, PgIdempotencyStore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConsumerConfig::from_env("reminder-service")?;
//! let consumer_bus = AmqpBus::connect(&config.rabbitmq_url, "reminder-service").await?;
//! let publisher_bus = consumer_bus.open_channel().await?;
//! let pool = sqlx::PgPool::connect(&config.database_url).await?;
//!
//! let store = Arc::new(PgIdempotencyStore::new(pool));
//! store.ensure_schema().await?;
//!
//! let publisher = EventPublisher::new(Arc::new(publisher_bus), EVENTS_EXCHANGE);
//! let runtime = ConsumerRuntime::new(config, Arc::new(consumer_bus), publisher, store);
//! // runtime.register("user.registered", WelcomeHandler);
//! runtime.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod context;
mod handler;
pub mod idempotency;
pub mod lock;
pub mod metrics;
mod runtime;
pub mod shutdown;

pub use config::{ConfigError, ConsumerConfig};
pub use context::EventContext;
pub use handler::{EventHandler, HandlerError, HandlerRegistry};
pub use idempotency::{
    spawn_idempotency_cleanup, IdempotencyStore, InMemoryIdempotencyStore, InMemoryTx,
    MarkOutcome, PgIdempotencyStore, ProcessedEvent, StoreError,
};
pub use lock::{lock_key, with_lock, AdvisoryLock, LockError, WithLockError};
pub use metrics::ConsumerMetrics;
pub use runtime::{ConsumerRuntime, DeliveryOutcome};
pub use shutdown::cancel_on_signal;

use event_bus::BusError;

/// Errors that stop a consumer
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("delivery stream for `{0}` closed")]
    StreamClosed(String),
}
