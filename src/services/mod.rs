// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Services
//!
//! The user and order services built on the messaging layer. Both keep their
//! records in memory with sequential ids, persist first and publish the
//! corresponding integration event afterwards. There is no outbox: when the
//! publish fails the record stays and the caller gets
//! `ServiceError::Messaging`.

pub mod orders;
pub mod payments;
pub mod user_events;
pub mod users;

use crate::errors::AmqpError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Messaging(#[from] AmqpError),
}
