use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::EventContext;

/// Error returned by a handler; any error takes the retry path
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one event type.
///
/// `tx` is the transaction that already holds this event's idempotency
/// marker. Every write the handler makes must go through it so the marker and
/// the effects commit (or roll back) together.
#[async_trait]
pub trait EventHandler<Tx: Send>: Send + Sync {
    async fn handle(&self, ctx: &EventContext, tx: &mut Tx) -> Result<(), HandlerError>;
}

/// Event type → handler
pub struct HandlerRegistry<Tx: Send> {
    handlers: HashMap<String, Arc<dyn EventHandler<Tx>>>,
}

impl<Tx: Send> HandlerRegistry<Tx> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `event_type`; a later registration replaces an earlier one
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler<Tx>>) {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::warn!(event_type = %event_type, "Replacing previously registered handler");
        }
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler<Tx>>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<Tx: Send> Default for HandlerRegistry<Tx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl EventHandler<()> for Noop {
        async fn handle(&self, _ctx: &EventContext, _tx: &mut ()) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup_and_ordering() {
        let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
        registry.register("user.registered", Arc::new(Noop));
        registry.register("program.plan.persisted", Arc::new(Noop));
        registry.register("user.registered", Arc::new(Noop));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("user.registered").is_some());
        assert!(registry.get("ghost.event").is_none());
        assert_eq!(
            registry.event_types(),
            vec!["program.plan.persisted".to_string(), "user.registered".to_string()]
        );
    }
}
