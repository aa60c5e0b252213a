// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings consumed by the connection manager. Every field has a
//! default so a process can start against a local broker without any
//! environment at all.

use crate::errors::AmqpError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{env, str::FromStr, time::Duration};

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_RECOVERY_INTERVAL: &str = "RABBITMQ_RECOVERY_INTERVAL_SECS";
pub const ENV_MAX_RECOVERY_ATTEMPTS: &str = "RABBITMQ_MAX_RECOVERY_ATTEMPTS";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-services";
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 6;

/// Everything but RFC 3986 unreserved characters gets escaped in URI parts.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for this connection
    pub connection_name: String,
    /// Fixed delay between reconnection attempts
    pub recovery_interval: Duration,
    /// Attempts before a recovering caller gets a retryable error
    pub max_recovery_attempts: u32,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
            vhost: DEFAULT_VHOST.to_owned(),
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the process environment.
    ///
    /// Missing keys keep their default; present but unparsable numbers fail
    /// with `AmqpError::InvalidConfig`.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RabbitMQConfigs::default();

        let recovery_secs: Option<u64> = parse(&lookup, ENV_RECOVERY_INTERVAL)?;

        Ok(RabbitMQConfigs {
            host: lookup(ENV_HOST).unwrap_or(defaults.host),
            port: parse(&lookup, ENV_PORT)?.unwrap_or(defaults.port),
            user: lookup(ENV_USER).unwrap_or(defaults.user),
            password: lookup(ENV_PASSWORD).unwrap_or(defaults.password),
            vhost: lookup(ENV_VHOST).unwrap_or(defaults.vhost),
            connection_name: lookup(ENV_APP_NAME).unwrap_or(defaults.connection_name),
            recovery_interval: recovery_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_interval),
            max_recovery_attempts: parse(&lookup, ENV_MAX_RECOVERY_ATTEMPTS)?
                .unwrap_or(defaults.max_recovery_attempts),
        })
    }

    /// AMQP URI for this configuration, with the credentials and the virtual
    /// host percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.user, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, URI_COMPONENT)
        )
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>, AmqpError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AmqpError::InvalidConfig(format!("{key}={raw}"))),
    }
}
