// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Abstraction
//!
//! The publisher, consumer and topology declarator only talk to the broker
//! through `MessageChannel`. Channels are handed out by a `ChannelFactory`,
//! which owns the connection and its recovery policy. The lapin-backed
//! implementation lives in `channel`, the process-local one in `memory`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::{
    collections::BTreeMap,
    fmt,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode marking a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Stream of deliveries for one consumer. It ends when the channel or the
/// underlying connection goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    /// Unix seconds
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub kind: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// Settles a single delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        properties: MessageProperties,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Acknowledges this single delivery, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges this single delivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A session over a broker connection.
///
/// A channel is not meant to be shared by concurrent publishers; callers
/// serialize access or use one channel each.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Number of ready messages in the queue.
    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Owner of the broker connection, handing out channels on demand.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError>;

    /// Fixed delay between recovery attempts.
    fn recovery_interval(&self) -> Duration;
}
