// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Harness Configuration
//!
//! Settings are read from an optional `config/default` file and then from
//! `HARNESS_`-prefixed environment variables, using `__` between nested keys
//! (`HARNESS_RABBITMQ__HOST`, `HARNESS_WORKLOAD__CONSUMER_COUNT`, ...).
//! Every field falls back to the built-in defaults below.

use crate::{connection::BrokerEndpoint, errors::AmqpError, exchange::ExchangeKind};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

pub const ENV_PREFIX: &str = "HARNESS";
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Top-level configuration settings for the harness.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub rabbitmq: RabbitMQSettings,
    pub topology: TopologySettings,
    pub workload: WorkloadSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "rabbitmq-harness".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

/// Broker endpoint settings.
#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct RabbitMQSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub automatic_recovery: bool,
}

impl Default for RabbitMQSettings {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_owned(),
            port: 5672,
            vhost: "exemplo_amqp".to_owned(),
            user: "usuario".to_owned(),
            password: "senha".to_owned(),
            automatic_recovery: true,
        }
    }
}

impl std::fmt::Debug for RabbitMQSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMQSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("password", &"***")
            .field("automatic_recovery", &self.automatic_recovery)
            .finish()
    }
}

impl RabbitMQSettings {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            automatic_recovery: self.automatic_recovery,
        }
    }
}

/// Names of the exchange, queue and binding the harness provisions.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TopologySettings {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            exchange: "minha_exchange".to_owned(),
            exchange_kind: ExchangeKind::Topic,
            queue: "queue1_work".to_owned(),
            routing_key: "app".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadSettings {
    pub producer_count: usize,
    pub consumer_count: usize,
    pub warmup_delay_secs: u64,
    /// Highest sequence number each producer publishes.
    pub messages_per_producer: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            producer_count: 2,
            consumer_count: 10,
            warmup_delay_secs: 30,
            messages_per_producer: 499_999,
        }
    }
}

impl WorkloadSettings {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_secs(self.warmup_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_step_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_step_secs: 2,
        }
    }
}

/// Loads the settings from the default file location and the environment.
pub fn load_settings() -> Result<Settings, AmqpError> {
    load_settings_from(DEFAULT_CONFIG_FILE)
}

/// Loads the settings using `file` (without extension) as the optional file source.
pub fn load_settings_from(file: &str) -> Result<Settings, AmqpError> {
    let built = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|err| {
            error!(error = err.to_string(), "failure to read configuration");
            AmqpError::ConfigError(err.to_string())
        })?;

    built.try_deserialize::<Settings>().map_err(|err| {
        error!(error = err.to_string(), "failure to deserialize configuration");
        AmqpError::ConfigError(err.to_string())
    })
}
