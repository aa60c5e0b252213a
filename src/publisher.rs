// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes typed messages to JSON and publishes them either straight to a
//! queue (through the default exchange) or to a direct exchange with a
//! routing key. The target topology is declared before the first send on the
//! publisher's channel. Messages are persistent, carry a fresh UUID message
//! id and a Unix timestamp, and propagate the OpenTelemetry context in their
//! headers.
//!
//! Publishing is not idempotent: a retried publish may deliver twice.

use crate::{
    errors::AmqpError,
    events::IntegrationEvent,
    exchange::ExchangeDefinition,
    otel,
    queue::QueueDefinition,
    topology::TopologyDeclarator,
    transport::{ChannelFactory, MessageProperties, JSON_CONTENT_TYPE},
};
use chrono::Utc;
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Publisher owning one channel.
///
/// Concurrent `publish` calls are serialized on that channel.
pub struct RabbitMQPublisher {
    factory: Arc<dyn ChannelFactory>,
    topology: Mutex<TopologyDeclarator>,
    dead_letter: bool,
}

impl RabbitMQPublisher {
    /// Creates a publisher with its own channel.
    pub async fn new(
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        Self::build(factory, false).await
    }

    /// Creates a publisher whose queues carry a `<queue>-dlq` dead-letter
    /// queue, matching consumers started with
    /// [`ConsumerOptions::with_dead_letter`](crate::dispatcher::ConsumerOptions::with_dead_letter).
    pub async fn with_dead_letter(
        factory: Arc<dyn ChannelFactory>,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        Self::build(factory, true).await
    }

    async fn build(
        factory: Arc<dyn ChannelFactory>,
        dead_letter: bool,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        let channel = factory.create_channel().await?;

        Ok(Arc::new(RabbitMQPublisher {
            factory,
            topology: Mutex::new(TopologyDeclarator::new(channel)),
            dead_letter,
        }))
    }

    /// Publishes `message` to `exchange` with `routing_key`, declaring the
    /// exchange as a durable direct exchange first.
    ///
    /// # Parameters
    /// * `exchange` - Name of the direct exchange to publish to
    /// * `routing_key` - Routing key the exchange routes on
    /// * `message` - Value serialized to the JSON payload
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the message, or the serialization,
    /// declaration or send error
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(message)?;

        let mut topology = self.topology.lock().await;
        self.ensure_open(&mut topology).await?;
        topology
            .declare_exchange(&ExchangeDefinition::new(exchange).direct().durable())
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), exchange, "failed to publish message to exchange")
            })?;

        let props = self.properties();
        match topology
            .channel()
            .publish(exchange, routing_key, &payload, &props)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "failed to publish message to exchange");
                Err(err)
            }
            _ => {
                info!(
                    exchange,
                    routing_key,
                    message_id = ?props.message_id,
                    "message published to exchange"
                );
                Ok(())
            }
        }
    }

    /// Publishes `message` directly to `queue`, declaring it as a durable,
    /// non-exclusive, non-auto-delete queue first. Publishers built with
    /// [`RabbitMQPublisher::with_dead_letter`] declare the queue's DLQ too.
    ///
    /// # Parameters
    /// * `queue` - Name of the target queue, used as the routing key on the
    ///   default exchange
    /// * `message` - Value serialized to the JSON payload
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the message, or the serialization,
    /// declaration or send error
    pub async fn publish_to_queue<T>(&self, queue: &str, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let mut def = QueueDefinition::new(queue).durable();
        if self.dead_letter {
            def = def.with_dlq();
        }

        self.publish_to_defined_queue(&def, message).await
    }

    /// Publishes `message` to the queue described by `def`, declaring it
    /// first with exactly those parameters.
    pub async fn publish_to_defined_queue<T>(
        &self,
        def: &QueueDefinition,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(message)?;
        let queue = def.name();

        let mut topology = self.topology.lock().await;
        self.ensure_open(&mut topology).await?;
        topology
            .declare_queue(def)
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), queue, "failed to publish message to queue")
            })?;

        let props = self.properties();
        match topology.channel().publish("", queue, &payload, &props).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "failed to publish message to queue");
                Err(err)
            }
            _ => {
                info!(queue, message_id = ?props.message_id, "message published to queue");
                Ok(())
            }
        }
    }

    /// Publishes an event to its own exchange and routing key.
    pub async fn publish_event<E: IntegrationEvent>(&self, event: &E) -> Result<(), AmqpError> {
        self.publish(E::EXCHANGE, event.routing_key(), event).await
    }

    /// Closes the publisher's channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.topology.lock().await.channel().close().await
    }

    /// Replaces a channel lost with its connection. Declarations are per
    /// channel, so the cache starts over.
    async fn ensure_open(&self, topology: &mut TopologyDeclarator) -> Result<(), AmqpError> {
        if topology.channel().is_open() {
            return Ok(());
        }

        warn!("publisher channel closed, opening a new one");
        let channel = self.factory.create_channel().await?;
        *topology = TopologyDeclarator::new(channel);
        Ok(())
    }

    fn properties(&self) -> MessageProperties {
        let mut headers = BTreeMap::new();
        otel::inject(&Context::current(), &mut headers);

        MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now().timestamp() as u64),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            kind: None,
            persistent: true,
            headers,
        }
    }
}

fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize message");
        AmqpError::SerializationError(err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::OrderCreatedEvent,
        transport::{MessageChannel, MockMessageChannel},
    };
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use serde::ser::Error as _;
    use std::time::Duration;

    struct SingleChannel(Arc<MockMessageChannel>);

    #[async_trait]
    impl ChannelFactory for SingleChannel {
        async fn create_channel(&self) -> Result<Arc<dyn MessageChannel>, AmqpError> {
            Ok(self.0.clone())
        }

        fn recovery_interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    struct Cyclic;

    impl Serialize for Cyclic {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cycle detected"))
        }
    }

    fn order() -> OrderCreatedEvent {
        OrderCreatedEvent {
            order_id: 1,
            user_id: 7,
            product_name: "Widget".into(),
            quantity: 2,
            price: 9.99,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn serialization_failure_sends_nothing() {
        let mut channel = MockMessageChannel::new();
        channel.expect_is_open().never();
        channel.expect_declare_exchange().never();
        channel.expect_publish().never();

        let publisher = RabbitMQPublisher::new(Arc::new(SingleChannel(Arc::new(channel))))
            .await
            .unwrap();

        let err = publisher
            .publish("order.events", "order.created", &Cyclic)
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::SerializationError(_)));
    }

    #[tokio::test]
    async fn publishes_persistent_json_with_identity() {
        let mut channel = MockMessageChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_declare_exchange()
            .with(eq(ExchangeDefinition::new("order.events").direct().durable()))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                let body: OrderCreatedEvent = serde_json::from_slice(payload).unwrap();
                exchange == "order.events"
                    && key == "order.created"
                    && body.product_name == "Widget"
                    && props.persistent
                    && props.timestamp.is_some()
                    && props.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
                    && props
                        .message_id
                        .as_deref()
                        .map(|id| Uuid::parse_str(id).is_ok())
                        .unwrap_or(false)
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(SingleChannel(Arc::new(channel))))
            .await
            .unwrap();

        publisher.publish_event(&order()).await.unwrap();
        publisher.publish_event(&order()).await.unwrap();
    }

    #[tokio::test]
    async fn queue_form_declares_the_queue_and_uses_the_default_exchange() {
        let mut channel = MockMessageChannel::new();
        channel.expect_is_open().return_const(true);
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("audit").durable()))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, _, _| exchange.is_empty() && key == "audit")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(SingleChannel(Arc::new(channel))))
            .await
            .unwrap();

        publisher.publish_to_queue("audit", &order()).await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_publisher_declares_the_queue_with_its_dlq() {
        let mut channel = MockMessageChannel::new();
        channel.expect_is_open().return_const(true);
        let mut seq = mockall::Sequence::new();
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("audit-dlq").durable()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("audit").durable().with_dlq()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, _, _| exchange.is_empty() && key == "audit")
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let publisher =
            RabbitMQPublisher::with_dead_letter(Arc::new(SingleChannel(Arc::new(channel))))
                .await
                .unwrap();

        publisher.publish_to_queue("audit", &order()).await.unwrap();
        publisher.publish_to_queue("audit", &order()).await.unwrap();
    }

    #[tokio::test]
    async fn send_failures_are_returned_to_the_caller() {
        let mut channel = MockMessageChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("channel closed".into())));

        let publisher = RabbitMQPublisher::new(Arc::new(SingleChannel(Arc::new(channel))))
            .await
            .unwrap();

        let err = publisher.publish_event(&order()).await.unwrap_err();
        assert_eq!(err, AmqpError::PublishingError("channel closed".into()));
    }
}
