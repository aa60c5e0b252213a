// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker speaking the same `MessageChannel` contract as the
//! lapin adapter. It is meant for tests and single-process development:
//!
//! - direct, fanout and topic exchanges, plus the default exchange routing by
//!   queue name
//! - idempotent declarations, with conflicting redeclarations rejected
//! - per-channel prefetch and round-robin dispatch between the consumers of
//!   one queue
//! - ack, nack with requeue, and dead-lettering for queues configured with a
//!   DLQ
//! - unacknowledged deliveries go back to the queue when their channel closes
//!   or is dropped
//! - `disconnect` simulates a connection loss for every open channel
//!
//! Unroutable messages are dropped, as with `mandatory = false`.

use crate::{
    config::DEFAULT_RECOVERY_INTERVAL,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, ChannelFactory, Delivery, DeliveryStream, MessageChannel,
        MessageProperties,
    },
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type SharedState = Arc<Mutex<BrokerState>>;

/// Process-local broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: SharedState,
    recovery_interval: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
        }
    }

    /// Overrides the delay consumers wait before re-subscribing after a
    /// simulated connection loss.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Opens a channel without going through the `ChannelFactory` trait.
    pub fn open_channel(&self) -> Arc<InMemoryChannel> {
        let id = {
            let mut state = lock(&self.state);
            state.next_channel += 1;
            state.next_channel
        };

        Arc::new(InMemoryChannel {
            id,
            broker: self.clone(),
            prefetch: AtomicU16::new(0),
        })
    }

    /// Closes every open channel, ending all consumer streams and returning
    /// their unacknowledged deliveries to the queues.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        warn!("simulating broker connection loss");

        let last = state.next_channel;
        state.closed_channels.extend(1..=last);

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = state.queues.get_mut(&name) {
                let consumers: Vec<u64> = queue.consumers.iter().map(|c| c.id).collect();
                queue.consumers.clear();
                for id in consumers {
                    queue.requeue_unacked(id);
                }
            }
        }
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.ready.len())
    }

    /// Delivered but not yet settled messages in a queue.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.consumers.len())
    }

    /// Bodies of the ready messages of a queue, in delivery order.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        lock(&self.state).exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        lock(&self.state).queues.get(name).map(|q| q.def.clone())
    }

    pub fn exchange_count(&self) -> usize {
        lock(&self.state).exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.state).queues.len()
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.state).bindings.len()
    }
}

#[async_trait]
impl ChannelFactory for InMemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError> {
        let channel = self.open_channel();
        debug!(channel = channel.id, "channel created");
        Ok(channel)
    }

    fn recovery_interval(&self) -> Duration {
        self.recovery_interval
    }
}

/// Channel on an `InMemoryBroker`.
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = lock(&self.broker.state);
        if state.closed_channels.contains(&self.id) {
            return Err(AmqpError::ChannelError(format!("channel {} is closed", self.id)));
        }
        Ok(state)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name.is_empty() {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        let mut state = self.state()?;
        match state.exchanges.get(&def.name) {
            Some(existing) if existing == def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflict(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if def.name.is_empty() {
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let mut state = self.state()?;
        match state.queues.get(&def.name) {
            Some(existing) if existing.def == *def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflict(def.name.clone())),
            None => {
                state
                    .queues
                    .insert(def.name.clone(), QueueState::new(def.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        drop(self.state()?);
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: payload.to_vec(),
            redelivered: false,
        };

        let weak = Arc::downgrade(&self.broker.state);
        let routed = state.enqueue(exchange, routing_key, message, &weak)?;
        if routed == 0 {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state()?;
        state.next_consumer += 1;
        let id = state.next_consumer;

        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(ConsumerSlot {
                id,
                channel: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                in_flight: 0,
                sender,
            }),
            None => return Err(AmqpError::ConsumerDeclarationError(queue.to_owned())),
        }

        debug!(queue, consumer_tag, consumer = id, "consumer registered");
        state.dispatch(queue, &Arc::downgrade(&self.broker.state));

        Ok(Box::pin(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let state = self.state()?;
        match state.queues.get(queue) {
            Some(q) => Ok(q.ready.len() as u32),
            None => Err(AmqpError::DeclareQueueError(queue.to_owned())),
        }
    }

    fn is_open(&self) -> bool {
        !lock(&self.broker.state).closed_channels.contains(&self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.release();
        Ok(())
    }
}

impl InMemoryChannel {
    /// Marks the channel closed, drops its consumers and hands their
    /// unacknowledged deliveries to the remaining consumers.
    fn release(&self) {
        let mut state = lock(&self.broker.state);
        if !state.closed_channels.insert(self.id) {
            return;
        }

        let weak = Arc::downgrade(&self.broker.state);
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = state.queues.get_mut(&name) {
                let mine: Vec<u64> = queue
                    .consumers
                    .iter()
                    .filter(|c| c.channel == self.id)
                    .map(|c| c.id)
                    .collect();
                queue.consumers.retain(|c| c.channel != self.id);
                for id in mine {
                    queue.requeue_unacked(id);
                }
            }
            state.dispatch(&name, &weak);
        }

        debug!(channel = self.id, "channel closed");
    }
}

// A channel dropped without `close`, e.g. by an aborted consumer task, closes
// as it would on connection loss.
impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settlement) -> Result<(), AmqpError> {
        let failure = match outcome {
            Settlement::Ack => AmqpError::AckMessageError,
            Settlement::Nack { .. } => AmqpError::NackMessageError,
        };

        let Some(state) = self.state.upgrade() else {
            return Err(failure);
        };
        let mut guard = lock(&state);
        guard.settle(&self.queue, self.tag, outcome, &self.state)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(Settlement::Nack { requeue })
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<QueueBinding>,
    closed_channels: HashSet<u64>,
    next_channel: u64,
    next_consumer: u64,
    next_tag: u64,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    consumer: u64,
    message: StoredMessage,
}

struct ConsumerSlot {
    id: u64,
    channel: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    unacked: BTreeMap<u64, Unacked>,
}

impl QueueState {
    fn new(def: QueueDefinition) -> Self {
        QueueState {
            def,
            ready: VecDeque::new(),
            consumers: vec![],
            cursor: 0,
            unacked: BTreeMap::new(),
        }
    }

    /// Puts a consumer's unsettled deliveries back at the head of the queue,
    /// keeping their original order.
    fn requeue_unacked(&mut self, consumer: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                self.ready.push_front(unacked.message);
            }
        }

        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
    }
}

impl BrokerState {
    /// Queues a message reaches through `exchange` with `routing_key`.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>, AmqpError> {
        if exchange.is_empty() {
            let mut targets = BTreeSet::new();
            if self.queues.contains_key(routing_key) {
                targets.insert(routing_key.to_owned());
            }
            return Ok(targets);
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match def.kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue_name.clone())
            .collect())
    }

    /// Routes a message and returns the number of queues it landed in.
    fn enqueue(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
        weak: &Weak<Mutex<BrokerState>>,
    ) -> Result<usize, AmqpError> {
        let targets = self.route(exchange, routing_key)?;
        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(target, weak);
        }
        Ok(targets.len())
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue: &str, weak: &Weak<Mutex<BrokerState>>) {
        let BrokerState {
            queues, next_tag, ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        loop {
            let n = q.consumers.len();
            if n == 0 || q.ready.is_empty() {
                break;
            }

            let cursor = q.cursor % n;
            let Some(idx) = (0..n)
                .map(|i| (cursor + i) % n)
                .find(|&i| q.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = q.ready.pop_front() else {
                break;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery::new(
                tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.properties.clone(),
                message.data.clone(),
                Box::new(MemoryAcker {
                    state: weak.clone(),
                    queue: queue.to_owned(),
                    tag,
                }),
            );

            if q.consumers[idx].sender.send(Ok(delivery)).is_err() {
                // receiver dropped without closing the channel
                let gone = q.consumers.remove(idx);
                q.ready.push_front(message);
                q.requeue_unacked(gone.id);
                continue;
            }

            q.consumers[idx].in_flight += 1;
            let consumer = q.consumers[idx].id;
            q.unacked.insert(tag, Unacked { consumer, message });
            q.cursor = (idx + 1) % n;
        }
    }

    fn settle(
        &mut self,
        queue: &str,
        tag: u64,
        outcome: Settlement,
        weak: &Weak<Mutex<BrokerState>>,
    ) -> Result<(), AmqpError> {
        let failure = match outcome {
            Settlement::Ack => AmqpError::AckMessageError,
            Settlement::Nack { .. } => AmqpError::NackMessageError,
        };

        let Some(q) = self.queues.get_mut(queue) else {
            return Err(failure);
        };
        let Some(Unacked {
            consumer,
            mut message,
        }) = q.unacked.remove(&tag)
        else {
            return Err(failure);
        };

        if let Some(slot) = q.consumers.iter_mut().find(|c| c.id == consumer) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        let mut dead = None;
        match outcome {
            Settlement::Ack => {}
            Settlement::Nack { requeue: true } => {
                message.redelivered = true;
                q.ready.push_front(message);
            }
            Settlement::Nack { requeue: false } => {
                if let Some(target) = q.def.dead_letter() {
                    dead = Some((target, message));
                }
            }
        }

        self.dispatch(queue, weak);

        if let Some((target, message)) = dead {
            if let Err(err) = self.enqueue(&target.exchange, &target.routing_key, message, weak) {
                warn!(error = err.to_string(), queue, "dead letter target unavailable");
            }
        }

        Ok(())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|i| go(rest, &key[i..])),
            Some((&"*", rest)) => !key.is_empty() && go(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && go(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
