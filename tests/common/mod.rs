// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use chrono::Utc;
use rabbitmq_services::events::OrderCreatedEvent;
use std::time::Duration;

/// Polls `check` until it holds or five seconds passed.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn order(order_id: i32) -> OrderCreatedEvent {
    OrderCreatedEvent {
        order_id,
        user_id: 7,
        product_name: "Widget".to_owned(),
        quantity: 2,
        price: 9.99,
        created_at: Utc::now(),
    }
}
