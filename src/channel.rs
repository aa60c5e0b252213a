// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `AmqpConnection` owns the single long-lived broker connection of a process
//! and creates channels on demand. A lost connection is re-established on the
//! next channel request, retrying at a fixed interval; callers block during
//! the outage and get a retryable `ConnectionError` if recovery gives up.
//!
//! `AmqpChannel` adapts a lapin channel to the `MessageChannel` contract.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, ChannelFactory, Delivery, DeliveryStream, MessageChannel,
        MessageProperties, PERSISTENT_DELIVERY_MODE,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

const REPLY_SUCCESS: u16 = 200;

/// A live broker connection, as seen by `AmqpConnection`.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens broker connections for `AmqpConnection`, both at startup and during
/// recovery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// Process-wide broker connection.
///
/// Created once at startup with `connect`, shared by reference (`Arc`) with
/// every publisher and consumer, and closed explicitly at shutdown.
pub struct AmqpConnection {
    cfg: RabbitMQConfigs,
    connector: Arc<dyn Connector>,
    conn: RwLock<Arc<dyn BrokerConnection>>,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Establishes the connection described by `cfg`.
    ///
    /// There is no offline mode: a failed initial attempt is returned to the
    /// caller, which is expected to abort startup.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<AmqpConnection>, AmqpError> {
        Self::connect_with(cfg, Arc::new(LapinConnector)).await
    }

    /// Same as `connect`, opening connections through `connector`.
    pub async fn connect_with(
        cfg: &RabbitMQConfigs,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<AmqpConnection>, AmqpError> {
        let conn = connector.open(cfg).await?;

        Ok(Arc::new(AmqpConnection {
            cfg: cfg.clone(),
            connector,
            conn: RwLock::new(conn),
            closed: AtomicBool::new(false),
        }))
    }

    /// Closes the connection. Channel requests after this point fail.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);

        let conn = self.conn.read().await.clone();
        if !conn.is_connected() {
            return Ok(());
        }

        conn.close().await?;
        info!(host = self.cfg.host, "amqp connection closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .try_read()
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// Returns a live connection, recovering it first if it was lost.
    async fn current(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }

        {
            let conn = self.conn.read().await;
            if conn.is_connected() {
                return Ok(conn.clone());
            }
        }

        let mut conn = self.conn.write().await;
        // another caller may have recovered while we waited for the lock
        if conn.is_connected() {
            return Ok(conn.clone());
        }

        for attempt in 1..=self.cfg.max_recovery_attempts {
            warn!(
                attempt,
                host = self.cfg.host,
                "amqp connection lost, recovering..."
            );
            tokio::time::sleep(self.cfg.recovery_interval).await;

            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match self.connector.open(&self.cfg).await {
                Ok(recovered) => {
                    *conn = recovered;
                    info!(attempt, "amqp connection recovered");
                    return Ok(conn.clone());
                }
                Err(err) => {
                    error!(error = err.to_string(), attempt, "recovery attempt failed");
                }
            }
        }

        Err(AmqpError::ConnectionError(format!(
            "unable to recover connection to {}:{}",
            self.cfg.host, self.cfg.port
        )))
    }
}

#[async_trait]
impl ChannelFactory for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError> {
        self.current().await?.create_channel().await
    }

    fn recovery_interval(&self) -> Duration {
        self.cfg.recovery_interval
    }
}

/// `Connector` dialing the broker with lapin.
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn open(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = cfg.host, port = cfg.port, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        match Connection::connect(&cfg.uri(), options).await {
            Ok(conn) => {
                conn.on_error(|err| {
                    error!(error = err.to_string(), "amqp connection error");
                });
                info!(host = cfg.host, port = cfg.port, "amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    host = cfg.host,
                    port = cfg.port,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                info!(channel = channel.id(), "channel created");
                Ok(Arc::new(AmqpChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

/// lapin-backed `MessageChannel`.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        AmqpChannel { channel }
    }
}

#[async_trait]
impl MessageChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();
        if let Some(dead_letter) = def.dead_letter() {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dead_letter.exchange)),
            );
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dead_letter.routing_key)),
            );
        }

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(Box::pin(consumer.map(|result| match result {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.exchange.to_string(),
                delivery.routing_key.to_string(),
                delivery.redelivered,
                from_basic_properties(&delivery.properties),
                delivery.data,
                Box::new(LapinAcker {
                    acker: delivery.acker,
                }),
            )),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        })))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(q) => Ok(q.message_count()),
            Err(err) => {
                error!(error = err.to_string(), queue, "error to inspect the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        match self.channel.close(REPLY_SUCCESS, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "error to close the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
            _ => {
                debug!(channel = self.channel.id(), "channel closed");
                Ok(())
            }
        }
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));

    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(timestamp) = props.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }

    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    AMQPValue::ShortString(v) => v.to_string(),
                    _ => return None,
                };
                Some((key.to_string(), value))
            })
            .collect(),
        None => BTreeMap::new(),
    };

    MessageProperties {
        message_id: props.message_id().as_ref().map(|id| id.to_string()),
        timestamp: *props.timestamp(),
        content_type: props.content_type().as_ref().map(|ct| ct.to_string()),
        kind: props.kind().as_ref().map(|kind| kind.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}
