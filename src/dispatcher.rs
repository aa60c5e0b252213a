// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Loop
//!
//! `RabbitMQConsumer` subscribes a typed handler to a queue, optionally bound
//! to an exchange and routing key, and runs the delivery loop as a background
//! task. Each subscription gets its own channel with a prefetch of one, so a
//! consumer holds at most one unacknowledged delivery and runs its handler
//! strictly sequentially.
//!
//! The loop only suspends while waiting for the next delivery. Cancelling it
//! through the returned `ConsumerHandle` lets the in-flight handler finish,
//! then closes the channel. When the delivery stream ends because the
//! connection was lost, the loop waits the recovery interval, opens a new
//! channel, redeclares its topology and resumes.

use crate::{
    consumer::{process_delivery, DeliveryOutcome, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    topology::TopologyDeclarator,
    transport::{ChannelFactory, DeliveryStream, MessageChannel},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unacknowledged deliveries a consumer channel may hold.
pub const PREFETCH_COUNT: u16 = 1;

const TRACER_NAME: &str = "amqp consumer";

/// Consumer settings.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    dead_letter: bool,
    recovery_interval: Option<Duration>,
    consumer_tag: Option<String>,
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes rejected messages to `<queue>-dlq` instead of dropping them.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    /// Overrides the channel factory's recovery interval.
    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }
}

/// What a consume loop is attached to.
#[derive(Debug, Clone)]
enum Subscription {
    Queue {
        queue: QueueDefinition,
    },
    Exchange {
        exchange: ExchangeDefinition,
        routing_key: String,
        queue: QueueDefinition,
    },
}

impl Subscription {
    fn queue(&self) -> &QueueDefinition {
        match self {
            Subscription::Queue { queue } | Subscription::Exchange { queue, .. } => queue,
        }
    }

    /// Name used in logs and spans.
    fn source(&self) -> String {
        match self {
            Subscription::Queue { queue } => queue.name.clone(),
            Subscription::Exchange {
                exchange,
                routing_key,
                ..
            } => format!("{}/{}", exchange.name, routing_key),
        }
    }
}

/// Starts consume loops on channels from a `ChannelFactory`.
pub struct RabbitMQConsumer {
    factory: Arc<dyn ChannelFactory>,
    options: ConsumerOptions,
}

impl RabbitMQConsumer {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        RabbitMQConsumer {
            factory,
            options: ConsumerOptions::default(),
        }
    }

    pub fn with_options(factory: Arc<dyn ChannelFactory>, options: ConsumerOptions) -> Self {
        RabbitMQConsumer { factory, options }
    }

    /// Consumes `queue` directly, declaring it durable first.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume
    /// * `handler` - Called with every decoded message, one at a time
    ///
    /// # Returns
    /// A handle on the running loop, or the first setup error
    pub async fn consume<T, H>(&self, queue: &str, handler: H) -> Result<ConsumerHandle, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let subscription = Subscription::Queue {
            queue: self.queue_definition(queue),
        };
        self.start(subscription, Arc::new(handler)).await
    }

    /// Consumes `queue` after binding it to `exchange` with `routing_key`.
    ///
    /// The exchange is declared as a durable direct exchange and the queue as
    /// a durable queue, with its DLQ when the consumer was built with
    /// [`ConsumerOptions::with_dead_letter`]. Setup errors (declaration, QoS,
    /// subscription) are returned before any message is consumed.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange to bind to
    /// * `routing_key` - Binding key on that exchange
    /// * `queue` - Name of the queue to consume
    /// * `handler` - Called with every decoded message, one at a time
    ///
    /// # Returns
    /// A handle on the running loop, or the first setup error
    pub async fn consume_bound<T, H>(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
        handler: H,
    ) -> Result<ConsumerHandle, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + 'static,
    {
        let subscription = Subscription::Exchange {
            exchange: ExchangeDefinition::new(exchange).direct().durable(),
            routing_key: routing_key.to_owned(),
            queue: self.queue_definition(queue),
        };
        self.start(subscription, Arc::new(handler)).await
    }

    fn queue_definition(&self, queue: &str) -> QueueDefinition {
        let def = QueueDefinition::new(queue).durable();
        if self.options.dead_letter {
            def.with_dlq()
        } else {
            def
        }
    }

    async fn start<T>(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Result<ConsumerHandle, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let consumer_tag = self
            .options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", subscription.queue().name, Uuid::new_v4()));

        let consume_loop = ConsumeLoop {
            factory: self.factory.clone(),
            subscription,
            consumer_tag,
            recovery_interval: self
                .options
                .recovery_interval
                .unwrap_or_else(|| self.factory.recovery_interval()),
            handler,
            _message: PhantomData,
        };

        let source = consume_loop.subscription.source();
        let (channel, deliveries) = match consume_loop.subscribe().await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                error!(error = err.to_string(), source, "failed to start consuming");
                return Err(err);
            }
        };
        info!(source, "started consuming messages");

        let token = CancellationToken::new();
        let task = tokio::spawn(consume_loop.run(channel, deliveries, token.clone()));

        Ok(ConsumerHandle {
            source,
            token,
            task,
        })
    }
}

struct ConsumeLoop<T> {
    factory: Arc<dyn ChannelFactory>,
    subscription: Subscription,
    consumer_tag: String,
    recovery_interval: Duration,
    handler: Arc<dyn MessageHandler<T>>,
    _message: PhantomData<fn() -> T>,
}

impl<T> ConsumeLoop<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Opens a channel, declares the topology, sets the prefetch and starts
    /// the broker-side consumer.
    async fn subscribe(&self) -> Result<(Arc<dyn MessageChannel>, DeliveryStream), AmqpError> {
        let channel = self.factory.create_channel().await?;
        let mut topology = TopologyDeclarator::new(channel.clone());

        let declared = match &self.subscription {
            Subscription::Queue { queue } => topology.declare_queue(queue).await,
            Subscription::Exchange {
                exchange,
                routing_key,
                queue,
            } => topology.declare_binding(exchange, queue, routing_key).await,
        };

        let stream = match declared {
            Ok(()) => match channel.set_prefetch(PREFETCH_COUNT).await {
                Ok(()) => {
                    channel
                        .consume(&self.subscription.queue().name, &self.consumer_tag)
                        .await
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "error closing channel");
                }
                Err(err)
            }
        }
    }

    async fn run(
        self,
        mut channel: Arc<dyn MessageChannel>,
        mut deliveries: DeliveryStream,
        token: CancellationToken,
    ) {
        let tracer = global::tracer(TRACER_NAME);
        let source = self.subscription.source();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let handler = self.handler.as_ref();
                        match process_delivery(&tracer, &source, &delivery, handler).await {
                            Ok(DeliveryOutcome::Acked) => {}
                            Ok(DeliveryOutcome::Rejected(reason)) => {
                                debug!(reason = reason.to_string(), source, "message rejected");
                            }
                            Err(err) => {
                                error!(error = err.to_string(), source, "error consume msg")
                            }
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), source, "errors consume msg")
                    }
                    None => match self.recover(&token).await {
                        Some((recovered, stream)) => {
                            channel = recovered;
                            deliveries = stream;
                        }
                        None => break,
                    },
                },
            }
        }

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), source, "error closing channel");
        }
        info!(source, "stopped consuming messages");
    }

    /// Re-subscribes after the delivery stream ended. Returns `None` if the
    /// loop was cancelled meanwhile.
    async fn recover(
        &self,
        token: &CancellationToken,
    ) -> Option<(Arc<dyn MessageChannel>, DeliveryStream)> {
        let source = self.subscription.source();

        loop {
            warn!(
                source,
                interval = ?self.recovery_interval,
                "delivery stream closed, resubscribing"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.recovery_interval) => {}
            }

            match self.subscribe().await {
                Ok(subscribed) => {
                    info!(source, "consumer recovered");
                    return Some(subscribed);
                }
                Err(err) => error!(error = err.to_string(), source, "failed to resubscribe"),
            }
        }
    }
}

/// Handle to a running consume loop.
pub struct ConsumerHandle {
    source: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Queue or exchange/routing key the loop consumes from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Asks the loop to stop after the in-flight delivery, if any.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the loop and waits for it to drain and close its channel.
    /// The loop is aborted if it has not stopped within `timeout`; its
    /// in-flight delivery is then left to the broker to redeliver.
    ///
    /// # Parameters
    /// * `timeout` - How long the in-flight delivery may take to finish
    ///
    /// # Returns
    /// Ok(()) once the loop stopped, `ShutdownTimeout` if it was aborted
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), AmqpError> {
        self.token.cancel();

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                error!(error = err.to_string(), source = self.source, "consume loop failed");
                Err(AmqpError::InternalError)
            }
            Err(_) => {
                warn!(source = self.source, "consume loop did not drain in time, aborting");
                self.task.abort();
                Err(AmqpError::ShutdownTimeout(self.source))
            }
        }
    }

    /// Waits until the loop stops on its own or through `cancel`.
    pub async fn wait(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "tokio process error");
            AmqpError::InternalError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        events::UserCreatedEvent,
        transport::{Delivery, MockMessageChannel},
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use mockall::predicate::eq;

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

    async fn noop(_: UserCreatedEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    #[tokio::test]
    async fn failed_setup_closes_the_channel_and_reports() {
        let mut channel = MockMessageChannel::new();
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("users").durable()))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .with(eq(PREFETCH_COUNT))
            .times(1)
            .returning(|_| Err(AmqpError::QoSDeclarationError("channel closed".into())));
        channel.expect_consume().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let consumer = RabbitMQConsumer::new(Arc::new(SingleChannel(Arc::new(channel))));
        let err = consumer
            .consume::<UserCreatedEvent, _>("users", noop)
            .await
            .err()
            .unwrap();

        assert_eq!(err, AmqpError::QoSDeclarationError("channel closed".into()));
    }

    #[tokio::test]
    async fn dead_letter_option_declares_the_dlq_first() {
        let mut seq = mockall::Sequence::new();
        let mut channel = MockMessageChannel::new();
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("users-dlq").durable()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .with(eq(QueueDefinition::new("users").durable().with_dlq()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_set_prefetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_consume()
            .withf(|queue, tag| queue == "users" && tag == "users-consumer")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Box::pin(stream::pending::<Result<Delivery, AmqpError>>())));
        channel.expect_close().returning(|| Ok(()));

        let consumer = RabbitMQConsumer::with_options(
            Arc::new(SingleChannel(Arc::new(channel))),
            ConsumerOptions::new()
                .with_dead_letter()
                .consumer_tag("users-consumer"),
        );
        let handle = consumer
            .consume::<UserCreatedEvent, _>("users", noop)
            .await
            .unwrap();

        assert_eq!(handle.source(), "users");
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
