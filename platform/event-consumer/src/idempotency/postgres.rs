use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{IdempotencyStore, MarkOutcome, ProcessedEvent, StoreError};

/// Default marker table
pub const DEFAULT_TABLE: &str = "processed_events";

/// PostgreSQL-backed idempotency store
///
/// The table name is interpolated into SQL, so it is validated as a plain
/// identifier at construction.
#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
    table: String,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if !is_plain_identifier(&table) {
            return Err(StoreError::InvalidTableName(table));
        }
        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the marker table and its cleanup index if missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                client_generated_id UUID PRIMARY KEY,
                event_type          TEXT NOT NULL,
                user_id             UUID NOT NULL,
                processed_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            table = self.table
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_processed_at_idx ON {table} (processed_at)",
            table = self.table
        );
        sqlx::query(&create_index).execute(&self.pool).await?;

        debug!(table = %self.table, "Idempotency schema ensured");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        Ok(tx.rollback().await?)
    }

    async fn check_and_mark_processed(
        &self,
        tx: &mut Self::Tx,
        event: &ProcessedEvent,
    ) -> Result<MarkOutcome, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (client_generated_id, event_type, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (client_generated_id) DO NOTHING
            RETURNING 1
            "#,
            self.table
        );

        let inserted: Option<i32> = sqlx::query_scalar(&sql)
            .bind(event.client_generated_id)
            .bind(&event.event_type)
            .bind(event.user_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(match inserted {
            Some(_) => MarkOutcome::Fresh,
            None => MarkOutcome::AlreadySeen,
        })
    }

    async fn is_processed(
        &self,
        tx: &mut Self::Tx,
        client_generated_id: Uuid,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE client_generated_id = $1)",
            self.table
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(client_generated_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE processed_at < now() - make_interval(days => $1)",
            self.table
        );
        let days = i32::try_from(days).unwrap_or(i32::MAX);
        let result = sqlx::query(&sql).bind(days).execute(&self.pool).await?;

        info!(
            table = %self.table,
            retention_days = days,
            deleted = result.rows_affected(),
            "Idempotency markers cleaned up"
        );
        Ok(result.rows_affected())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes (PostgreSQL's identifier limit)
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
