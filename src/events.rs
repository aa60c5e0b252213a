// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Contracts
//!
//! Domain events exchanged between the user and order services. Field names
//! are camelCase on the wire, unknown fields are ignored on decode, and a
//! missing timestamp decodes as the Unix epoch.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Exchange names.
pub mod exchanges {
    pub const ORDER_EVENTS: &str = "order.events";
    pub const PAYMENT_EVENTS: &str = "payment.events";
    pub const USER_EVENTS: &str = "user.events";
}

/// Routing keys.
pub mod routing_keys {
    pub const ORDER_CREATED: &str = "order.created";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const USER_CREATED: &str = "user.created";
}

/// Queue names.
pub mod queues {
    /// The order service's subscription to `user.created`.
    pub const ORDER_SERVICE_USER_CREATED: &str = "order.service.user.created";
}

/// An event published to a fixed exchange.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EXCHANGE: &'static str;

    fn routing_key(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: i32,
    pub user_id: i32,
    pub product_name: String,
    pub quantity: i32,
    pub price: f64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl IntegrationEvent for OrderCreatedEvent {
    const EXCHANGE: &'static str = exchanges::ORDER_EVENTS;

    fn routing_key(&self) -> &'static str {
        routing_keys::ORDER_CREATED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedEvent {
    pub user_id: i32,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl IntegrationEvent for UserCreatedEvent {
    const EXCHANGE: &'static str = exchanges::USER_EVENTS;

    fn routing_key(&self) -> &'static str {
        routing_keys::USER_CREATED
    }
}

/// Outcome of a payment attempt. Failed attempts travel on
/// `payment.failed`, successful ones on `payment.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompletedEvent {
    pub order_id: i32,
    pub is_success: bool,
    pub payment_method: String,
    pub transaction_id: String,
    #[serde(default)]
    pub processed_at: DateTime<Utc>,
}

impl IntegrationEvent for PaymentCompletedEvent {
    const EXCHANGE: &'static str = exchanges::PAYMENT_EVENTS;

    fn routing_key(&self) -> &'static str {
        if self.is_success {
            routing_keys::PAYMENT_COMPLETED
        } else {
            routing_keys::PAYMENT_FAILED
        }
    }
}
