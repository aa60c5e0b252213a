// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{
    payments::{PaymentProcessor, PaymentRequest, PaymentResult},
    ServiceError,
};
use crate::{
    events::{OrderCreatedEvent, PaymentCompletedEvent},
    publisher::RabbitMQPublisher,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const STATUS_PENDING: &str = "Pending";
pub const PAYMENT_UNPAID: &str = "Unpaid";
pub const PAYMENT_PAID: &str = "Paid";
pub const PAYMENT_FAILED: &str = "Failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i32,
    pub user_id: i32,
    pub product_name: String,
    pub quantity: i32,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub payment_status: String,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

impl Order {
    pub fn total(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: i32,
    pub product_name: String,
    pub quantity: i32,
    pub price: f64,
}

impl CreateOrderRequest {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.product_name.trim().is_empty() {
            return Err(ServiceError::Validation("product name is required".to_owned()));
        }
        if self.quantity <= 0 {
            return Err(ServiceError::Validation("quantity must be positive".to_owned()));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(ServiceError::Validation("price must be a non-negative number".to_owned()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct OrderStore {
    next_id: i32,
    orders: BTreeMap<i32, Order>,
}

pub struct OrderService {
    store: RwLock<OrderStore>,
    publisher: Arc<RabbitMQPublisher>,
    payments: Arc<dyn PaymentProcessor>,
}

impl OrderService {
    pub fn new(publisher: Arc<RabbitMQPublisher>, payments: Arc<dyn PaymentProcessor>) -> Self {
        OrderService {
            store: RwLock::new(OrderStore::default()),
            publisher,
            payments,
        }
    }

    pub async fn list(&self) -> Vec<Order> {
        self.store.read().await.orders.values().cloned().collect()
    }

    pub async fn get(&self, id: i32) -> Result<Order, ServiceError> {
        self.store
            .read()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    pub async fn list_by_user(&self, user_id: i32) -> Vec<Order> {
        self.store
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Stores a pending order, then announces it on
    /// `order.events`/`order.created`.
    pub async fn create(&self, request: CreateOrderRequest) -> Result<Order, ServiceError> {
        request.validate()?;

        let order = {
            let mut store = self.store.write().await;
            store.next_id += 1;
            let order = Order {
                id: store.next_id,
                user_id: request.user_id,
                product_name: request.product_name,
                quantity: request.quantity,
                price: request.price,
                created_at: Utc::now(),
                status: STATUS_PENDING.to_owned(),
                payment_status: PAYMENT_UNPAID.to_owned(),
                payment_method: None,
                paid_at: None,
                transaction_id: None,
            };
            store.orders.insert(order.id, order.clone());
            order
        };

        let event = OrderCreatedEvent {
            order_id: order.id,
            user_id: order.user_id,
            product_name: order.product_name.clone(),
            quantity: order.quantity,
            price: order.price,
            created_at: order.created_at,
        };
        self.publisher.publish_event(&event).await?;

        info!(order_id = order.id, "order created");
        Ok(order)
    }

    pub async fn update_status(&self, id: i32, status: &str) -> Result<(), ServiceError> {
        if status.trim().is_empty() {
            return Err(ServiceError::Validation("status is required".to_owned()));
        }

        let mut store = self.store.write().await;
        let order = store.orders.get_mut(&id).ok_or_else(|| not_found(id))?;
        order.status = status.to_owned();

        info!(order_id = id, status, "order status updated");
        Ok(())
    }

    pub async fn delete(&self, id: i32) -> Result<(), ServiceError> {
        match self.store.write().await.orders.remove(&id) {
            Some(_) => Ok(()),
            None => Err(not_found(id)),
        }
    }

    /// Charges the order total and publishes the outcome on
    /// `payment.completed` or `payment.failed`.
    ///
    /// A failed payment is not an error: the result says what happened and
    /// the order keeps `PAYMENT_FAILED` until paid again.
    pub async fn pay(
        &self,
        id: i32,
        request: PaymentRequest,
    ) -> Result<PaymentResult, ServiceError> {
        if request.payment_method.trim().is_empty() {
            return Err(ServiceError::Validation("payment method is required".to_owned()));
        }

        let order = self.get(id).await?;
        if order.payment_status == PAYMENT_PAID {
            return Err(ServiceError::Validation(format!("order {id} is already paid")));
        }

        let result = self.payments.process(order.total(), &request).await;
        let processed_at = Utc::now();

        {
            let mut store = self.store.write().await;
            let order = store.orders.get_mut(&id).ok_or_else(|| not_found(id))?;
            order.payment_method = Some(request.payment_method.clone());
            if result.is_success {
                order.payment_status = PAYMENT_PAID.to_owned();
                order.paid_at = Some(processed_at);
                order.transaction_id = Some(result.transaction_id.clone());
            } else {
                order.payment_status = PAYMENT_FAILED.to_owned();
            }
        }

        let event = PaymentCompletedEvent {
            order_id: id,
            is_success: result.is_success,
            payment_method: request.payment_method,
            transaction_id: result.transaction_id.clone(),
            processed_at,
        };
        self.publisher.publish_event(&event).await?;

        if result.is_success {
            info!(order_id = id, transaction_id = result.transaction_id, "order paid");
        } else {
            warn!(order_id = id, reason = result.message, "order payment failed");
        }
        Ok(result)
    }
}

fn not_found(id: i32) -> ServiceError {
    ServiceError::NotFound(format!("order {id}"))
}
