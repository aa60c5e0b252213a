// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Simulated payment gateway used by the order service.

use super::ServiceError;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{ops::RangeInclusive, time::Duration};
use tracing::{info, warn};

/// Probability that a payment fails without being asked to.
pub const RANDOM_FAILURE_RATE: f64 = 0.05;

const DELAY_MS: RangeInclusive<u64> = 500..=2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub payment_method: String,
    #[serde(default)]
    pub simulate_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub is_success: bool,
    /// Empty when the payment failed.
    pub transaction_id: String,
    pub message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn process(&self, amount: f64, request: &PaymentRequest) -> PaymentResult;
}

/// Payment processor that waits a random delay and succeeds most of the time.
pub struct SimulatedPaymentProcessor {
    delay: RangeInclusive<u64>,
    failure_rate: f64,
}

impl Default for SimulatedPaymentProcessor {
    fn default() -> Self {
        SimulatedPaymentProcessor {
            delay: DELAY_MS,
            failure_rate: RANDOM_FAILURE_RATE,
        }
    }
}

impl SimulatedPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processing delay bounds in milliseconds. The range must not be empty.
    pub fn with_delay(mut self, delay: RangeInclusive<u64>) -> Result<Self, ServiceError> {
        if delay.is_empty() {
            return Err(ServiceError::Validation(format!(
                "empty payment delay range {}..={}",
                delay.start(),
                delay.end()
            )));
        }

        self.delay = delay;
        Ok(self)
    }

    /// Probability of a random failure, between 0 and 1.
    pub fn with_failure_rate(mut self, rate: f64) -> Result<Self, ServiceError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ServiceError::Validation(format!(
                "payment failure rate {rate} is not within 0..=1"
            )));
        }

        self.failure_rate = rate;
        Ok(self)
    }
}

#[async_trait]
impl PaymentProcessor for SimulatedPaymentProcessor {
    async fn process(&self, amount: f64, request: &PaymentRequest) -> PaymentResult {
        info!(amount, payment_method = request.payment_method, "processing payment");

        let delay = rand::thread_rng().gen_range(self.delay.clone());
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if request.simulate_failure {
            warn!("payment failed as requested");
            return PaymentResult {
                is_success: false,
                transaction_id: String::new(),
                message: "Payment failed: Simulated failure".to_owned(),
            };
        }

        if rand::thread_rng().gen_bool(self.failure_rate) {
            warn!("payment failed randomly");
            return PaymentResult {
                is_success: false,
                transaction_id: String::new(),
                message: "Payment failed: Insufficient funds".to_owned(),
            };
        }

        let transaction_id = transaction_id();
        info!(transaction_id, "payment successful");
        PaymentResult {
            is_success: true,
            transaction_id,
            message: "Payment processed successfully".to_owned(),
        }
    }
}

/// `TXN_<yyyyMMddHHmmss>_<1000..9999>`
fn transaction_id() -> String {
    let suffix = rand::thread_rng().gen_range(1000..9999);
    format!("TXN_{}_{suffix}", Utc::now().format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(simulate_failure: bool) -> PaymentRequest {
        PaymentRequest {
            payment_method: "card".to_owned(),
            simulate_failure,
        }
    }

    #[test]
    fn transaction_ids_have_timestamp_and_suffix() {
        let id = transaction_id();
        let parts: Vec<&str> = id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TXN");
        assert_eq!(parts[1].len(), 14);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        let suffix: u32 = parts[2].parse().unwrap();
        assert!((1000..9999).contains(&suffix));
    }

    #[tokio::test(start_paused = true)]
    async fn forced_failure_has_no_transaction() {
        let processor = SimulatedPaymentProcessor::new().with_failure_rate(0.0).unwrap();

        let result = processor.process(10.0, &request(true)).await;
        assert!(!result.is_success);
        assert!(result.transaction_id.is_empty());
        assert_eq!(result.message, "Payment failed: Simulated failure");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_when_no_failure_is_drawn() {
        let processor = SimulatedPaymentProcessor::new().with_failure_rate(0.0).unwrap();

        let result = processor.process(10.0, &request(false)).await;
        assert!(result.is_success);
        assert!(result.transaction_id.starts_with("TXN_"));
        assert_eq!(result.message, "Payment processed successfully");
    }

    #[tokio::test(start_paused = true)]
    async fn random_failure_reports_insufficient_funds() {
        let processor = SimulatedPaymentProcessor::new().with_failure_rate(1.0).unwrap();

        let result = processor.process(10.0, &request(false)).await;
        assert!(!result.is_success);
        assert_eq!(result.message, "Payment failed: Insufficient funds");
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        #[allow(clippy::reversed_empty_ranges)]
        let empty = 5..=1;
        assert!(matches!(
            SimulatedPaymentProcessor::new().with_delay(empty),
            Err(ServiceError::Validation(_))
        ));

        for rate in [f64::NAN, -0.1, 1.5] {
            assert!(matches!(
                SimulatedPaymentProcessor::new().with_failure_rate(rate),
                Err(ServiceError::Validation(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_point_delay_is_accepted() {
        let processor = SimulatedPaymentProcessor::new()
            .with_delay(0..=0)
            .and_then(|p| p.with_failure_rate(0.0))
            .unwrap();

        let result = processor.process(1.0, &request(false)).await;
        assert!(result.is_success);
    }
}
