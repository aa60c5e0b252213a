// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Services
//!
//! Messaging layer shared by the user and order services: a recovering
//! connection manager, idempotent topology declaration, a JSON publisher and
//! a typed consume loop with prefetch one and ack/nack settlement.
//!
//! The broker is reached through the `transport` traits. `channel` is the
//! lapin implementation, `memory` a process-local broker for tests.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod services;
pub mod topology;
pub mod transport;

pub use consumer::{DeliveryOutcome, MessageHandler};
