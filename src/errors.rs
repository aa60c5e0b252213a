// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! `AmqpError` covers every failure the broker integration can surface:
//! connection and channel lifecycle, topology declaration, publishing and the
//! consumer-side delivery outcomes. `HandlerError` is what a message handler
//! returns to ask for a negative acknowledgment.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid configuration value
    #[error("invalid configuration `{0}`")]
    InvalidConfig(String),

    /// Error establishing (or re-establishing) a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Redeclaration of an existing entity with different parameters
    #[error("conflicting redeclaration of `{0}`")]
    TopologyConflict(String),

    /// Message could not be encoded, nothing was sent
    #[error("failure to serialize message: {0}")]
    SerializationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Delivered payload does not match the expected schema
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Handler rejected the message
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The consume loop did not drain before the shutdown deadline
    #[error("consumer `{0}` did not stop before the shutdown timeout")]
    ShutdownTimeout(String),
}

impl AmqpError {
    /// Whether retrying the operation later may succeed once the connection
    /// has recovered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_)
        )
    }
}

/// Failure reported by a message handler.
///
/// Returning it makes the consumer negatively acknowledge the delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
