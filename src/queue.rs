// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queues and queue-to-exchange bindings, including the optional
//! Dead Letter Queue (DLQ) a consumer can route rejected messages to.

/// Suffix appended to a queue name to build its dead letter queue name.
pub const DLQ_SUFFIX: &str = "-dlq";

/// Where the broker republishes messages rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created non-durable, non-exclusive and
    /// without auto-delete.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            dlq_name: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// Rejected messages are republished through the default exchange to
    /// `<name>-dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}{}", self.name, DLQ_SUFFIX));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Dead letter target derived from the DLQ setting.
    pub fn dead_letter(&self) -> Option<DeadLetter> {
        self.dlq_name.as_ref().map(|dlq| DeadLetter {
            exchange: String::new(),
            routing_key: dlq.clone(),
        })
    }

    /// Definition of the dead letter queue itself, if one is configured.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|dlq| QueueDefinition {
            name: dlq.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            dlq_name: None,
        })
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
