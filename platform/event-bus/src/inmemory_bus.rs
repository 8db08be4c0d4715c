//! In-memory implementation of the EventBus trait for testing and development

use crate::topology::{ConsumeOptions, ExchangeType, QueueOptions};
use crate::{Acknowledger, BusError, BusMessage, BusResult, Delivery, DeliveryStream, EventBus};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

/// EventBus implementation modelling a single RabbitMQ node in memory
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Pipeline tests that need the real acknowledgement semantics
///
/// What it models:
/// - Topic (`*` = one word, `#` = zero or more words), direct and default exchanges
/// - Queues with FIFO order, prefetch limits and manual acknowledgement
/// - Single-active-consumer: only the first registered consumer receives messages;
///   the next one takes over when it is cancelled or its channel closes
/// - A delivery dropped without being settled is requeued at the head of its queue
///   with `redelivered = true`, like an un-acked message on a closed channel
///
/// Every clone shares the same broker. [`InMemoryBus::channel`] opens another
/// channel on it; [`EventBus::close`] only tears down consumers of its own channel.
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, ConsumeOptions, EventBus, ExchangeType, InMemoryBus, QueueOptions};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.declare_exchange("app.events", ExchangeType::Topic).await?;
/// bus.declare_queue("svc.events", QueueOptions::service_queue()).await?;
/// bus.bind_queue("svc.events", "app.events", "user.#").await?;
///
/// bus.publish("app.events", BusMessage::new("user.registered", b"{}".to_vec())).await?;
///
/// let mut stream = bus
///     .consume("svc.events", ConsumeOptions { consumer_tag: "c1".into(), prefetch: 10 })
///     .await?;
/// let delivery = stream.next().await.unwrap()?;
/// assert_eq!(delivery.routing_key, "user.registered");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BrokerState>>,
    channel_id: u64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_delivery_tag: u64,
    next_consumer_id: u64,
    next_channel_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    message: BusMessage,
    redelivered: bool,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    next_round_robin: usize,
}

struct ConsumerSlot {
    id: u64,
    channel_id: u64,
    tag: String,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<PendingDelivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer_id: u64,
    message: QueuedMessage,
}

/// A delivery on its way to a consumer stream, not yet handed out
struct PendingDelivery {
    delivery_tag: u64,
    message: QueuedMessage,
}

impl InMemoryBus {
    /// Create a new in-memory broker and a first channel on it
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                next_channel_id: 1,
                ..BrokerState::default()
            })),
            channel_id: 0,
        }
    }

    /// Open another channel on the same broker
    pub fn channel(&self) -> Self {
        let mut state = self.lock();
        let channel_id = state.next_channel_id;
        state.next_channel_id += 1;
        Self {
            state: self.state.clone(),
            channel_id,
        }
    }

    /// Snapshot of the ready (not yet delivered) messages in a queue
    pub fn queue_messages(&self, queue: &str) -> Vec<BusMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of ready messages in a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of delivered but unsettled messages in a queue
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Number of consumers attached to a queue
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    /// Tag of the consumer currently receiving from a single-active-consumer queue
    pub fn active_consumer(&self, queue: &str) -> Option<String> {
        let state = self.lock();
        let q = state.queues.get(queue)?;
        if q.options.single_active_consumer {
            q.consumers.first().map(|c| c.tag.clone())
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// Check if a routing key matches a binding pattern
    ///
    /// AMQP topic rules over `.`-separated words:
    /// - `*` matches exactly one word
    /// - `#` matches zero or more words
    ///
    /// # Examples
    /// - `user.#` matches `user`, `user.registered` and `user.profile.updated`
    /// - `*.registered` matches `user.registered`
    /// - `user.*` does NOT match `user.profile.updated` (too many words)
    fn topic_matches(routing_key: &str, pattern: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        let pattern: Vec<&str> = pattern.split('.').collect();
        match_words(&pattern, &key)
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, key.get(skip..).unwrap_or(&[]))),
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => match_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) => first == word && match_words(rest, key_rest),
            None => false,
        },
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    // A panicking test thread must not wedge every other test sharing the broker
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand ready messages to consumers with spare prefetch capacity
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues,
        next_delivery_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let Some(idx) = pick_consumer(queue) else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        *next_delivery_tag += 1;
        let delivery_tag = *next_delivery_tag;

        let Some(consumer) = queue.consumers.get_mut(idx) else {
            queue.ready.push_front(message);
            break;
        };

        let pending = PendingDelivery {
            delivery_tag,
            message: message.clone(),
        };
        if consumer.sender.send(pending).is_ok() {
            consumer.in_flight += 1;
            let consumer_id = consumer.id;
            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    consumer_id,
                    message,
                },
            );
        } else {
            // Receiver is gone; forget the consumer and offer the message to the next one
            queue.ready.push_front(message);
            queue.consumers.remove(idx);
        }
    }
}

fn pick_consumer(queue: &mut QueueState) -> Option<usize> {
    if queue.consumers.is_empty() {
        return None;
    }
    if queue.options.single_active_consumer {
        return queue
            .consumers
            .first()
            .filter(|c| c.has_capacity())
            .map(|_| 0);
    }

    let len = queue.consumers.len();
    for offset in 0..len {
        let idx = (queue.next_round_robin + offset) % len;
        if queue.consumers.get(idx).is_some_and(|c| c.has_capacity()) {
            queue.next_round_robin = (idx + 1) % len;
            return Some(idx);
        }
    }
    None
}

/// Remove an unacked delivery, freeing prefetch capacity on its consumer
fn settle(state: &mut BrokerState, queue_name: &str, delivery_tag: u64) -> Option<QueuedMessage> {
    let queue = state.queues.get_mut(queue_name)?;
    let unacked = queue.unacked.remove(&delivery_tag)?;
    if let Some(consumer) = queue
        .consumers
        .iter_mut()
        .find(|c| c.id == unacked.consumer_id)
    {
        consumer.in_flight = consumer.in_flight.saturating_sub(1);
    }
    Some(unacked.message)
}

fn requeue_front(state: &mut BrokerState, queue_name: &str, mut message: QueuedMessage) {
    if let Some(queue) = state.queues.get_mut(queue_name) {
        message.redelivered = true;
        queue.ready.push_front(message);
    }
}

struct InMemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn finish(&self, requeue: bool) -> BusResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::AckError(format!(
                "delivery {} already settled",
                self.delivery_tag
            )));
        }
        let Some(state) = self.state.upgrade() else {
            return Err(BusError::ConnectionError("broker is gone".to_string()));
        };
        let mut state = lock_state(&state);
        let message = settle(&mut state, &self.queue, self.delivery_tag).ok_or_else(|| {
            BusError::AckError(format!("unknown delivery tag {}", self.delivery_tag))
        })?;
        if requeue {
            requeue_front(&mut state, &self.queue, message);
        }
        dispatch(&mut state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.finish(false)
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.finish(requeue)
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            // Dropped without settling: behave like a closed channel and requeue
            let _ = self.finish(true);
        }
    }
}

/// Detaches a consumer when its stream is dropped
struct ConsumerGuard {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    consumer_id: u64,
    rx: mpsc::UnboundedReceiver<PendingDelivery>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.rx.close();
        let mut buffered = Vec::new();
        while let Ok(pending) = self.rx.try_recv() {
            buffered.push(pending.delivery_tag);
        }

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock_state(&state);
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.consumers.retain(|c| c.id != self.consumer_id);
        }
        // Messages sent to this consumer but never handed out go back in order
        for tag in buffered.into_iter().rev() {
            if let Some(message) = settle(&mut state, &self.queue, tag) {
                requeue_front(&mut state, &self.queue, message);
            }
        }
        dispatch(&mut state, &self.queue);
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BusResult<()> {
        let mut state = self.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::TopologyError(format!(
                "exchange '{}' already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<()> {
        let mut state = self.lock();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BusError::TopologyError(format!(
                "queue '{}' already declared with different arguments",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        unacked: HashMap::new(),
                        next_round_robin: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(BusError::NotFound(format!("queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::NotFound(format!("exchange '{}'", exchange)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        let mut state = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange routes by queue name
            if state.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let kind = *state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::NotFound(format!("exchange '{}'", exchange)))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
                let matched = match kind {
                    ExchangeType::Topic => {
                        Self::topic_matches(&message.routing_key, &binding.routing_key)
                    }
                    ExchangeType::Direct => message.routing_key == binding.routing_key,
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        // Unroutable messages are dropped, as with mandatory=false
        for queue_name in targets {
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.ready.push_back(QueuedMessage {
                    exchange: exchange.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
            }
            dispatch(&mut state, &queue_name);
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        let consumer_id = {
            let mut state = self.lock();
            let consumer_id = state.next_consumer_id;
            state.next_consumer_id += 1;

            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::NotFound(format!("queue '{}'", queue)))?;
            if q
                .consumers
                .iter()
                .any(|c| c.channel_id == self.channel_id && c.tag == options.consumer_tag)
            {
                return Err(BusError::ConsumeError(format!(
                    "consumer tag '{}' already in use on this channel",
                    options.consumer_tag
                )));
            }
            q.consumers.push(ConsumerSlot {
                id: consumer_id,
                channel_id: self.channel_id,
                tag: options.consumer_tag.clone(),
                prefetch: options.prefetch,
                in_flight: 0,
                sender: tx,
            });
            dispatch(&mut state, queue);
            consumer_id
        };

        let mut guard = ConsumerGuard {
            state: Arc::downgrade(&self.state),
            queue: queue.to_string(),
            consumer_id,
            rx,
        };

        let stream = async_stream::stream! {
            while let Some(pending) = guard.rx.recv().await {
                let acker = InMemoryAcker {
                    state: guard.state.clone(),
                    queue: guard.queue.clone(),
                    delivery_tag: pending.delivery_tag,
                    settled: AtomicBool::new(false),
                };
                let PendingDelivery { delivery_tag, message } = pending;
                yield Ok(Delivery::new(
                    delivery_tag,
                    message.exchange,
                    message.message.routing_key,
                    message.message.payload,
                    message.message.headers,
                    message.redelivered,
                    Box::new(acker),
                ));
            }
        };

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            // Dropping the sender ends the stream once buffered deliveries are drained
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.channel_id && c.tag == consumer_tag));
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            dispatch(&mut state, &name);
        }
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != self.channel_id);
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            dispatch(&mut state, &name);
        }
        Ok(())
    }
}
