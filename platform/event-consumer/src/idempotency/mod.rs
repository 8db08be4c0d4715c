//! Idempotency key store
//!
//! One row per `client_generated_id`, written with
//! `INSERT … ON CONFLICT DO NOTHING RETURNING 1` inside the caller's
//! transaction. The marker is only visible once that transaction commits, so a
//! rolled-back handler leaves no marker behind and the retry runs again.

mod cleanup;
mod memory;
mod postgres;

pub use cleanup::spawn_idempotency_cleanup;
pub use memory::{InMemoryIdempotencyStore, InMemoryTx};
pub use postgres::{PgIdempotencyStore, DEFAULT_TABLE};

use async_trait::async_trait;
use event_bus::EventEnvelope;
use uuid::Uuid;

/// Marker written for a processed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub client_generated_id: Uuid,
    pub event_type: String,
    /// `UserId::System` is stored as the nil UUID
    pub user_id: Uuid,
}

impl ProcessedEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            client_generated_id: envelope.client_generated_id,
            event_type: envelope.event_type.clone(),
            user_id: envelope.user_id.as_uuid(),
        }
    }
}

/// Result of `check_and_mark_processed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Marker inserted; the handler should run
    Fresh,
    /// Marker already committed by an earlier delivery
    AlreadySeen,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid table name `{0}`")]
    InvalidTableName(String),

    /// Another open transaction holds the same marker
    #[error("idempotency key {0} is reserved by a concurrent transaction")]
    Contended(Uuid),
}

/// Transactional idempotency store
///
/// `Tx` is the unit of atomicity: the runtime begins it, marks the event, hands
/// the same value to the handler and commits or rolls back once. Dropping a
/// `Tx` without committing must roll it back.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn check_and_mark_processed(
        &self,
        tx: &mut Self::Tx,
        event: &ProcessedEvent,
    ) -> Result<MarkOutcome, StoreError>;

    /// Read-only check
    async fn is_processed(&self, tx: &mut Self::Tx, client_generated_id: Uuid)
        -> Result<bool, StoreError>;

    /// Delete markers older than `days`; returns rows deleted
    async fn cleanup_older_than(&self, days: u32) -> Result<u64, StoreError>;
}
