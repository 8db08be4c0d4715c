//! PostgreSQL advisory locks keyed by business identifiers
//!
//! A string key is hashed with 64-bit FNV-1a and the high bit is cleared, giving
//! a non-negative `bigint` for `pg_advisory_lock`. Distinct keys may collide;
//! prefix keys with their resource kind (see [`lock_key`]) to keep accidental
//! contention down.
//!
//! Session-scoped locks belong to the connection, not the transaction, so they
//! must be released on the same connection that took them. [`with_lock`] owns a
//! dedicated pooled connection for that reason. Inside a transaction prefer
//! [`AdvisoryLock::acquire_xact`], which the server releases at commit or
//! rollback.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, error, warn};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 63-bit lock id for `key`
pub fn lock_id_for(key: &str) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash & (u64::MAX >> 1)) as i64
}

/// `"<kind>:<id>"`, e.g. `lock_key("program", id)`
pub fn lock_key(kind: &str, id: impl std::fmt::Display) -> String {
    format!("{}:{}", kind, id)
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("advisory lock query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error from [`with_lock`]
#[derive(Debug, thiserror::Error)]
pub enum WithLockError<E> {
    /// Another session holds the lock
    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The scoped function failed; the lock was still released
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryLock {
    key: String,
    id: i64,
}

impl AdvisoryLock {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let id = lock_id_for(&key);
        Self { key, id }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_id(&self) -> i64 {
        self.id
    }

    /// Non-blocking exclusive acquire
    pub async fn try_acquire(&self, conn: &mut PgConnection) -> Result<bool, LockError> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.id)
            .fetch_one(conn)
            .await?;
        debug!(key = %self.key, lock_id = self.id, acquired, "try_acquire");
        Ok(acquired)
    }

    /// Block until the exclusive lock is granted
    pub async fn acquire(&self, conn: &mut PgConnection) -> Result<(), LockError> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Returns false if this session did not hold the lock
    pub async fn release(&self, conn: &mut PgConnection) -> Result<bool, LockError> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.id)
            .fetch_one(conn)
            .await?;
        Ok(released)
    }

    pub async fn try_acquire_shared(&self, conn: &mut PgConnection) -> Result<bool, LockError> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock_shared($1)")
            .bind(self.id)
            .fetch_one(conn)
            .await?;
        Ok(acquired)
    }

    pub async fn acquire_shared(&self, conn: &mut PgConnection) -> Result<(), LockError> {
        sqlx::query("SELECT pg_advisory_lock_shared($1)")
            .bind(self.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn release_shared(&self, conn: &mut PgConnection) -> Result<bool, LockError> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock_shared($1)")
            .bind(self.id)
            .fetch_one(conn)
            .await?;
        Ok(released)
    }

    /// Block until granted; held until the surrounding transaction ends
    pub async fn acquire_xact(&self, conn: &mut PgConnection) -> Result<(), LockError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.id)
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Run `f` while holding the exclusive lock for `key`.
///
/// Fails fast with [`WithLockError::LockBusy`] if the lock is held elsewhere.
/// The lock is released on every exit path, panics included (the panic is
/// resumed afterwards). If release fails the connection is detached from the
/// pool and dropped, which ends the session and frees the lock; the failure is
/// logged and never replaces `f`'s result.
pub async fn with_lock<F, Fut, T, E>(pool: &PgPool, key: &str, f: F) -> Result<T, WithLockError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let lock = AdvisoryLock::new(key);
    let mut conn = pool.acquire().await.map_err(LockError::from)?;

    if !lock.try_acquire(&mut conn).await? {
        return Err(WithLockError::LockBusy(key.to_string()));
    }

    let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;

    match lock.release(&mut conn).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(key = %key, lock_id = lock.lock_id(), "Advisory lock was not held at release");
        }
        Err(e) => {
            error!(
                key = %key,
                lock_id = lock.lock_id(),
                error = %e,
                "Failed to release advisory lock, closing session"
            );
            drop(conn.detach());
        }
    }

    match outcome {
        Ok(result) => result.map_err(WithLockError::Inner),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
