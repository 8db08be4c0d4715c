use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::IdempotencyStore;

/// Periodically delete idempotency markers older than `retention_days`.
///
/// Runs once right away, then every `interval`, until `shutdown` is cancelled.
/// A failed pass is logged and retried on the next tick.
pub fn spawn_idempotency_cleanup<S>(
    store: Arc<S>,
    retention_days: u32,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: IdempotencyStore,
{
    tokio::spawn(async move {
        info!(
            retention_days,
            interval_secs = interval.as_secs(),
            "Starting idempotency cleanup task"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match store.cleanup_older_than(retention_days).await {
                        Ok(deleted) => debug!(deleted, "Idempotency cleanup pass complete"),
                        Err(e) => warn!(error = %e, "Idempotency cleanup failed"),
                    }
                }
            }
        }

        info!("Idempotency cleanup task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{InMemoryIdempotencyStore, ProcessedEvent};
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_until_cancelled() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        store
            .check_and_mark_processed(
                &mut tx,
                &ProcessedEvent {
                    client_generated_id: id,
                    event_type: "user.registered".into(),
                    user_id: Uuid::nil(),
                },
            )
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
        store.backdate(id, Utc::now() - chrono::Duration::days(31));

        let shutdown = CancellationToken::new();
        let handle = spawn_idempotency_cleanup(
            Arc::clone(&store),
            30,
            Duration::from_secs(3600),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!store.contains(id));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
