use std::sync::{Mutex, MutexGuard};

use event_bus::{EventEnvelope, UserId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-delivery context handed to an [`EventHandler`](crate::EventHandler)
///
/// Downstream events queued with [`emit`](Self::emit) are published by the
/// runtime only after the handler's transaction commits. A handler that fails
/// or is rolled back emits nothing.
#[derive(Debug)]
pub struct EventContext {
    envelope: EventEnvelope,
    payload: Vec<u8>,
    routing_key: String,
    retry_count: u32,
    redelivered: bool,
    service_name: String,
    shutdown: CancellationToken,
    emitted: Mutex<Vec<EventEnvelope>>,
}

impl EventContext {
    pub fn new(
        envelope: EventEnvelope,
        payload: Vec<u8>,
        routing_key: impl Into<String>,
        retry_count: u32,
        redelivered: bool,
        service_name: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            envelope,
            payload,
            routing_key: routing_key.into(),
            retry_count,
            redelivered,
            service_name: service_name.into(),
            shutdown,
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// Raw message body as received
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserialize the envelope's `data` into the handler's payload type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.envelope.data_as()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// `x-retry-count` of this delivery; 0 on the first attempt
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Cancelled when the process is shutting down.
    ///
    /// A handler that gives up because of it should return an error so the
    /// delivery takes the retry path.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue an envelope for publication after commit
    pub fn emit(&self, envelope: EventEnvelope) {
        self.lock_emitted().push(envelope);
    }

    /// Build and queue an envelope sourced from this service
    pub fn emit_event(
        &self,
        event_type: impl Into<String>,
        user_id: impl Into<UserId>,
        data: Value,
    ) -> EventEnvelope {
        let envelope = EventEnvelope::new(event_type, user_id, self.service_name.clone(), data);
        self.emit(envelope.clone());
        envelope
    }

    /// Envelopes queued so far
    pub fn pending_emits(&self) -> usize {
        self.lock_emitted().len()
    }

    pub(crate) fn take_emitted(&self) -> Vec<EventEnvelope> {
        std::mem::take(&mut *self.lock_emitted())
    }

    fn lock_emitted(&self) -> MutexGuard<'_, Vec<EventEnvelope>> {
        self.emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
