// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! The order service's view of `user.created`.

use crate::{
    consumer::MessageHandler,
    dispatcher::{ConsumerHandle, RabbitMQConsumer},
    errors::{AmqpError, HandlerError},
    events::{exchanges, queues, routing_keys, UserCreatedEvent},
};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

/// Users the order service has heard about, keyed by id.
#[derive(Clone, Default)]
pub struct KnownUsers {
    users: Arc<RwLock<BTreeMap<i32, UserCreatedEvent>>>,
}

impl KnownUsers {
    pub async fn get(&self, user_id: i32) -> Option<UserCreatedEvent> {
        self.users.read().await.get(&user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

/// Records every created user.
#[derive(Clone, Default)]
pub struct UserCreatedListener {
    known: KnownUsers,
}

impl UserCreatedListener {
    pub fn new(known: KnownUsers) -> Self {
        UserCreatedListener { known }
    }

    /// Subscribes through `order.service.user.created`, bound to
    /// `user.events` with `user.created`.
    pub async fn subscribe(self, consumer: &RabbitMQConsumer) -> Result<ConsumerHandle, AmqpError> {
        consumer
            .consume_bound(
                exchanges::USER_EVENTS,
                routing_keys::USER_CREATED,
                queues::ORDER_SERVICE_USER_CREATED,
                self,
            )
            .await
    }
}

#[async_trait]
impl MessageHandler<UserCreatedEvent> for UserCreatedListener {
    async fn handle(&self, event: UserCreatedEvent) -> Result<(), HandlerError> {
        info!(user_id = event.user_id, "received user created event");
        self.known.users.write().await.insert(event.user_id, event);
        Ok(())
    }
}
