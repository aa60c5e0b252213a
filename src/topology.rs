// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! Exchanges, queues and bindings are declared idempotently before a channel
//! publishes or consumes through them. `TopologyDeclarator` remembers what it
//! declared on its channel: an identical redeclaration is answered locally,
//! a conflicting one fails with `AmqpError::TopologyConflict` before any I/O.
//! Conflicts with entities declared elsewhere are reported by the broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::MessageChannel,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error};

/// Declares topology on one channel, once per channel lifetime.
pub struct TopologyDeclarator {
    channel: Arc<dyn MessageChannel>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: HashSet<QueueBinding>,
}

impl TopologyDeclarator {
    pub fn new(channel: Arc<dyn MessageChannel>) -> TopologyDeclarator {
        TopologyDeclarator {
            channel,
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: HashSet::default(),
        }
    }

    /// The channel declarations are issued on.
    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    pub async fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self.exchanges.get(&def.name) {
            Some(existing) if existing == def => {
                debug!("exchange: {} already declared", def.name);
                return Ok(());
            }
            Some(existing) => {
                error!(
                    name = def.name,
                    existing = ?existing,
                    requested = ?def,
                    "conflicting exchange redeclaration"
                );
                return Err(AmqpError::TopologyConflict(def.name.clone()));
            }
            None => {}
        }

        self.channel.declare_exchange(def).await?;
        self.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    /// Declares the queue, and its dead letter queue first when it has one.
    pub async fn declare_queue(&mut self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if let Some(dlq) = def.dlq_definition() {
            self.declare_single_queue(&dlq).await?;
        }

        self.declare_single_queue(def).await
    }

    async fn declare_single_queue(&mut self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self.queues.get(&def.name) {
            Some(existing) if existing == def => {
                debug!("queue: {} already declared", def.name);
                return Ok(());
            }
            Some(existing) => {
                error!(
                    name = def.name,
                    existing = ?existing,
                    requested = ?def,
                    "conflicting queue redeclaration"
                );
                return Err(AmqpError::TopologyConflict(def.name.clone()));
            }
            None => {}
        }

        self.channel.declare_queue(def).await?;
        self.queues.insert(def.name.clone(), def.clone());
        Ok(())
    }

    pub async fn bind_queue(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        if self.bindings.contains(binding) {
            debug!(
                "queue: {} already bound to {} with {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            return Ok(());
        }

        self.channel.bind_queue(binding).await?;
        self.bindings.insert(binding.clone());
        Ok(())
    }

    /// Declares exchange, queue and binding in dependency order.
    pub async fn declare_binding(
        &mut self,
        exchange: &ExchangeDefinition,
        queue: &QueueDefinition,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.declare_exchange(exchange).await?;
        self.declare_queue(queue).await?;
        self.bind_queue(
            &QueueBinding::new(&queue.name)
                .exchange(&exchange.name)
                .routing_key(routing_key),
        )
        .await
    }
}
