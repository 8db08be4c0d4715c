//! In-memory idempotency store for tests and local development.
//!
//! Mirrors the PostgreSQL semantics closely enough for the consumer pipeline:
//! a marker is reserved when inserted, published on commit and released on
//! rollback or drop. A marker reserved by another open transaction is reported
//! as [`StoreError::Contended`] where PostgreSQL would block.
//!
//! Transactions can also stage rows (`insert_row`) that become visible only on
//! commit, which stands in for a handler's own table writes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{IdempotencyStore, MarkOutcome, ProcessedEvent, StoreError};

#[derive(Debug, Default)]
struct StoreState {
    processed: HashMap<Uuid, (ProcessedEvent, DateTime<Utc>)>,
    reserved: HashSet<Uuid>,
    rows: HashMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    state: Arc<Mutex<StoreState>>,
}

/// Open transaction against [`InMemoryIdempotencyStore`]
#[derive(Debug)]
pub struct InMemoryTx {
    state: Arc<Mutex<StoreState>>,
    marked: Vec<ProcessedEvent>,
    staged: Vec<(String, Value)>,
    finished: bool,
}

impl InMemoryTx {
    /// Stage a row for `table`; visible through [`InMemoryIdempotencyStore::rows`] after commit
    pub fn insert_row(&mut self, table: &str, row: Value) {
        self.staged.push((table.to_string(), row));
    }

    /// Rows staged in this transaction for `table`
    pub fn staged_rows(&self, table: &str) -> Vec<&Value> {
        self.staged
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, row)| row)
            .collect()
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        let mut state = lock_state(&self.state);
        for event in self.marked.drain(..) {
            state.reserved.remove(&event.client_generated_id);
        }
        self.staged.clear();
        self.finished = true;
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        self.release();
    }
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a committed marker exists
    pub fn contains(&self, client_generated_id: Uuid) -> bool {
        lock_state(&self.state)
            .processed
            .contains_key(&client_generated_id)
    }

    pub fn processed_count(&self) -> usize {
        lock_state(&self.state).processed.len()
    }

    /// Number of markers held by open transactions
    pub fn reserved_count(&self) -> usize {
        lock_state(&self.state).reserved.len()
    }

    /// Committed rows for `table`
    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock_state(&self.state)
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Move a committed marker's `processed_at`; returns false if absent
    pub fn backdate(&self, client_generated_id: Uuid, processed_at: DateTime<Utc>) -> bool {
        match lock_state(&self.state)
            .processed
            .get_mut(&client_generated_id)
        {
            Some(entry) => {
                entry.1 = processed_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTx {
            state: Arc::clone(&self.state),
            marked: Vec::new(),
            staged: Vec::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = lock_state(&self.state);
        for event in tx.marked.drain(..) {
            state.reserved.remove(&event.client_generated_id);
            state
                .processed
                .insert(event.client_generated_id, (event, now));
        }
        for (table, row) in tx.staged.drain(..) {
            state.rows.entry(table).or_default().push(row);
        }
        tx.finished = true;
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Tx) -> Result<(), StoreError> {
        tx.release();
        Ok(())
    }

    async fn check_and_mark_processed(
        &self,
        tx: &mut Self::Tx,
        event: &ProcessedEvent,
    ) -> Result<MarkOutcome, StoreError> {
        let id = event.client_generated_id;
        if tx.marked.iter().any(|e| e.client_generated_id == id) {
            return Ok(MarkOutcome::AlreadySeen);
        }

        let mut state = lock_state(&self.state);
        if state.processed.contains_key(&id) {
            return Ok(MarkOutcome::AlreadySeen);
        }
        if !state.reserved.insert(id) {
            return Err(StoreError::Contended(id));
        }
        drop(state);

        tx.marked.push(event.clone());
        Ok(MarkOutcome::Fresh)
    }

    async fn is_processed(
        &self,
        tx: &mut Self::Tx,
        client_generated_id: Uuid,
    ) -> Result<bool, StoreError> {
        if tx
            .marked
            .iter()
            .any(|e| e.client_generated_id == client_generated_id)
        {
            return Ok(true);
        }
        Ok(self.contains(client_generated_id))
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut state = lock_state(&self.state);
        let before = state.processed.len();
        state.processed.retain(|_, (_, processed_at)| *processed_at >= cutoff);
        Ok((before - state.processed.len()) as u64)
    }
}

fn lock_state(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
