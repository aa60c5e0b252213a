// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Every delivery goes through the same steps: decode the JSON body into the
//! expected type, run the handler, then settle the delivery exactly once.
//!
//! ```text
//! Received -> Decoding -> Handling -> Acked
//!                 |           |
//!                 v           v
//!          DecodeFailed  HandlingFailed -> Nacked (no requeue)
//! ```
//!
//! A handler failure, including a panic, is turned into a negative
//! acknowledgment and never escapes to the consume loop.

use crate::{
    errors::{AmqpError, HandlerError},
    otel,
    transport::Delivery,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe};
use tracing::{debug, error, info};

/// Processes messages of type `T` taken from a queue.
///
/// `Ok` acknowledges the delivery; `Err` rejects it without requeue.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: T) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: T) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Nacked without requeue; carries the `DecodeError` or `HandlerError`.
    Rejected(AmqpError),
}

/// Decodes, handles and settles a single delivery.
///
/// `source` names the queue or exchange the consumer is attached to and is
/// used for logs and the span name. An `Err` means the settlement itself
/// failed; the delivery's fate is then up to the broker.
pub(crate) async fn process_delivery<T>(
    tracer: &BoxedTracer,
    source: &str,
    delivery: &Delivery,
    handler: &dyn MessageHandler<T>,
) -> Result<DeliveryOutcome, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
{
    let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, source);

    debug!(
        source,
        exchange = delivery.exchange,
        routing_key = delivery.routing_key,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received message"
    );

    let message = match serde_json::from_slice::<T>(&delivery.data) {
        Ok(message) => message,
        Err(err) => {
            let reason = AmqpError::DecodeError(err.to_string());
            error!(error = reason.to_string(), source, "error decoding message");
            return reject(delivery, &mut span, reason).await;
        }
    };

    let failure = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.reason().to_owned()),
        Err(panic) => Some(panic_reason(panic)),
    };

    if let Some(reason) = failure {
        let reason = AmqpError::HandlerError(reason);
        error!(error = reason.to_string(), source, "error processing message");
        return reject(delivery, &mut span, reason).await;
    }

    match delivery.ack().await {
        Err(err) => {
            error!(error = err.to_string(), source, "error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        _ => {
            info!(source, "message processed successfully");
            span.set_status(Status::Ok);
            Ok(DeliveryOutcome::Acked)
        }
    }
}

async fn reject(
    delivery: &Delivery,
    span: &mut BoxedSpan,
    reason: AmqpError,
) -> Result<DeliveryOutcome, AmqpError> {
    span.record_error(&reason);
    span.set_status(Status::Error {
        description: Cow::from(reason.to_string()),
    });

    if let Err(err) = delivery.nack(false).await {
        error!(error = err.to_string(), "error whiling nack msg");
        return Err(err);
    }

    Ok(DeliveryOutcome::Rejected(reason))
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_owned()
    }
}
