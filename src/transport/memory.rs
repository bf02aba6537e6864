//! In-process broker.
//!
//! Mirrors the parts of AMQP 0-9-1 the bridge relies on: direct, fanout and
//! topic exchanges, `CC` header fan-out, per-consumer prefetch with
//! round-robin dispatch, ack/nack, and redelivery of unacknowledged messages
//! when a channel closes. Nothing is persisted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::debug;

use super::{
    Acker, BrokerChannel, ConsumeOptions, Connector, Delivery, DeliveryStream, FailureHook,
    CC_HEADER,
};
use crate::error::BrokerError;
use crate::types::{ExchangeType, HeaderValue, Headers, QueueStatus};

/// Shared handle to an in-process broker. Clones see the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: HashMap<u64, Unacked>,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

struct ExchangeEntry {
    kind: ExchangeType,
    durable: bool,
}

#[derive(PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct ChannelEntry {
    open: Arc<AtomicBool>,
    on_failure: FailureHook,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    headers: Headers,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    consumer_tag: String,
    message: StoredMessage,
}

struct QueueEntry {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

impl QueueEntry {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Round-robin pick of the next consumer with prefetch capacity.
    fn next_consumer(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % len;
                return Some(idx);
            }
        }
        None
    }

    fn status(&self, name: &str) -> QueueStatus {
        QueueStatus {
            queue: name.to_string(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn queue_status(&self, queue: &str) -> Option<QueueStatus> {
        self.lock().queues.get(queue).map(|entry| entry.status(queue))
    }

    /// Deliveries handed out and not yet settled, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Drop every open connection as a broker restart would.
    pub fn disconnect(&self) {
        let hooks = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| close_channel(&mut state, &self.weak(), id))
                .map(|entry| entry.on_failure)
                .collect::<Vec<_>>()
        };
        for hook in hooks {
            hook(BrokerError::new("CONNECTION_FORCED - broker forced connection closure"));
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.shared)
    }

    fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        uri: &str,
        on_failure: FailureHook,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::new(format!("connection refused: {uri}")));
        }

        let open = Arc::new(AtomicBool::new(true));
        let id = {
            let mut state = self.lock();
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(
                id,
                ChannelEntry {
                    open: Arc::clone(&open),
                    on_failure,
                },
            );
            id
        };
        debug!(channel = id, "Memory broker channel opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            open,
        }))
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::new("channel is closed"))
        }
    }

    /// Declare and bind failures are channel errors: the broker closes the
    /// channel and requeues its unacked deliveries.
    fn close_on_error(&self, state: &mut BrokerState, err: BrokerError) -> BrokerError {
        close_channel(state, &self.broker.weak(), self.id);
        self.open.store(false, Ordering::SeqCst);
        debug!(channel = self.id, error = %err.message, "Memory broker channel closed by error");
        err
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        // publishes are applied synchronously
        self.ensure_open()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if kind == ExchangeType::Headers {
            return Err(BrokerError::new(
                "NOT_IMPLEMENTED - headers exchanges are not supported in memory",
            ));
        }
        let mut state = self.broker.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                let err = BrokerError::new(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{name}': \
                     declared {kind}/durable={durable}, existing {}/durable={}",
                    existing.kind, existing.durable
                ));
                Err(self.close_on_error(&mut state, err))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeEntry { kind, durable });
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueStatus, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let entry = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueEntry::new(durable));
        if entry.durable != durable {
            let err = BrokerError::new(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"
            ));
            return Err(self.close_on_error(&mut state, err));
        }
        Ok(entry.status(name))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) {
            let err = BrokerError::new(format!("NOT_FOUND - no exchange '{exchange}'"));
            return Err(self.close_on_error(&mut state, err));
        }
        if !state.queues.contains_key(queue) {
            let err = BrokerError::new(format!("NOT_FOUND - no queue '{queue}'"));
            return Err(self.close_on_error(&mut state, err));
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

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut keys = vec![routing_key.to_string()];
        match headers.get(CC_HEADER) {
            Some(HeaderValue::List(extra)) => keys.extend(extra.iter().cloned()),
            Some(HeaderValue::Text(extra)) => keys.push(extra.clone()),
            _ => {}
        }

        let mut state = self.broker.lock();
        let targets = route(&state, exchange, &keys)?;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            headers,
            payload,
            redelivered: false,
        };
        let weak = self.broker.weak();
        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
            dispatch(&mut state, &weak, target);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let tag_in_use = state
            .queues
            .values()
            .flat_map(|entry| entry.consumers.iter())
            .any(|consumer| consumer.channel_id == self.id && consumer.tag == consumer_tag);
        if tag_in_use {
            return Err(BrokerError::new(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(BrokerError::new(format!("NOT_FOUND - no queue '{queue}'")));
        };

        let (sender, receiver) = mpsc::unbounded();
        entry.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            no_ack: options.no_ack,
            prefetch: options.prefetch,
            in_flight: 0,
            sender,
        });
        dispatch(&mut state, &self.broker.weak(), queue);
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for entry in state.queues.values_mut() {
            entry
                .consumers
                .retain(|consumer| !(consumer.channel_id == self.id && consumer.tag == consumer_tag));
        }
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueStatus, BrokerError> {
        self.ensure_open()?;
        self.broker
            .queue_status(queue)
            .ok_or_else(|| BrokerError::new(format!("NOT_FOUND - no queue '{queue}'")))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(BrokerError::new(format!("NOT_FOUND - no queue '{queue}'")));
        };
        let purged = entry.ready.len() as u32;
        entry.ready.clear();
        Ok(purged)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        close_channel(&mut state, &self.broker.weak(), self.id);
        self.open.store(false, Ordering::SeqCst);
        debug!(channel = self.id, "Memory broker channel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryAcker {
    shared: Weak<Shared>,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| BrokerError::new("broker is gone"))?;
        let mut state = lock_state(&shared);
        let Some(unacked) = state.unacked.remove(&self.delivery_tag) else {
            return Err(BrokerError::new(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            )));
        };

        let queue_name = unacked.queue.clone();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.channel_id == unacked.channel_id && c.tag == unacked.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            if requeue == Some(true) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        dispatch(&mut state, &self.shared, &queue_name);
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

/// Hand ready messages to consumers with spare prefetch capacity.
fn dispatch(state: &mut BrokerState, shared: &Weak<Shared>, queue_name: &str) {
    let BrokerState {
        queues,
        unacked,
        next_delivery_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let Some(idx) = queue.next_consumer() else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };
        *next_delivery_tag += 1;
        let delivery_tag = *next_delivery_tag;

        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            acker: Box::new(MemoryAcker {
                shared: shared.clone(),
                delivery_tag,
            }),
        };

        let consumer = &mut queue.consumers[idx];
        if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
            // receiver dropped without a cancel
            queue.consumers.remove(idx);
            queue.ready.push_front(message);
            continue;
        }
        if consumer.no_ack {
            continue;
        }
        consumer.in_flight += 1;
        unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue_name.to_string(),
                channel_id: consumer.channel_id,
                consumer_tag: consumer.tag.clone(),
                message,
            },
        );
    }
}

/// Tear down a channel: drop its consumers and requeue its unacked deliveries.
fn close_channel(state: &mut BrokerState, shared: &Weak<Shared>, id: u64) -> Option<ChannelEntry> {
    let entry = state.channels.remove(&id)?;
    entry.open.store(false, Ordering::SeqCst);

    for queue in state.queues.values_mut() {
        queue.consumers.retain(|consumer| consumer.channel_id != id);
    }

    let mut orphaned: Vec<(u64, Unacked)> = Vec::new();
    let tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, unacked)| unacked.channel_id == id)
        .map(|(tag, _)| *tag)
        .collect();
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            orphaned.push((tag, unacked));
        }
    }

    // push_front in reverse delivery order restores queue order
    orphaned.sort_by(|a, b| b.0.cmp(&a.0));
    let mut touched = BTreeSet::new();
    for (_, unacked) in orphaned {
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
            touched.insert(unacked.queue);
        }
    }
    for queue in touched {
        dispatch(state, shared, &queue);
    }
    Some(entry)
}

fn route(state: &BrokerState, exchange: &str, keys: &[String]) -> Result<BTreeSet<String>, BrokerError> {
    // default exchange routes by queue name
    if exchange.is_empty() {
        return Ok(keys
            .iter()
            .filter(|key| state.queues.contains_key(key.as_str()))
            .cloned()
            .collect());
    }

    let Some(entry) = state.exchanges.get(exchange) else {
        return Err(BrokerError::new(format!("NOT_FOUND - no exchange '{exchange}'")));
    };
    Ok(state
        .bindings
        .iter()
        .filter(|binding| binding.exchange == exchange)
        .filter(|binding| match entry.kind {
            ExchangeType::Direct => keys.iter().any(|key| *key == binding.routing_key),
            ExchangeType::Fanout => true,
            ExchangeType::Topic => keys.iter().any(|key| topic_matches(&binding.routing_key, key)),
            ExchangeType::Headers => false,
        })
        .map(|binding| binding.queue.clone())
        .collect())
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && words_match(rest, tail),
            None => false,
        },
    }
}
