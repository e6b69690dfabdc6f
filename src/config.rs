//! Configuration for the event bus.
//!
//! Supports YAML file and environment variable overrides.

use std::path::Path;

use serde::Deserialize;

use crate::dispatch::AckPolicy;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process messaging, for tests and single-process deployments.
    Memory,
}

/// Event bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpSettings,
    /// Dispatch and publish behavior shared by all backends.
    pub dispatch: DispatchSettings,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Exchange events are published to.
    pub exchange: String,
    /// Queue this subscriber group consumes from.
    pub queue: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "crossbus.events".to_string(),
            queue: "crossbus.default".to_string(),
        }
    }
}

/// Dispatch and publish behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Publish retries after the initial attempt.
    pub retry_count: u32,
    /// Upper bound on concurrently processed messages (memory backend).
    pub max_concurrent_dispatches: usize,
    /// Whether handler failures still acknowledge the message.
    pub ack_policy: AckPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry_count: 5,
            max_concurrent_dispatches: 10,
            ack_policy: AckPolicy::Always,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl BusSettings {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`CROSSBUS_CONFIG`, default `crossbus.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CROSSBUS_CONFIG").unwrap_or_else(|_| "crossbus.yaml".to_string());

        let mut settings = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        settings.apply_env_overrides();

        Ok(settings)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("AMQP_URL") {
            self.amqp.url = url;
        }

        if let Ok(queue) = std::env::var("EVENT_BUS_QUEUE") {
            self.amqp.queue = queue;
        }

        if let Ok(exchange) = std::env::var("EVENT_BUS_EXCHANGE") {
            self.amqp.exchange = exchange;
        }

        if let Ok(retries) = std::env::var("EVENT_BUS_RETRY_COUNT") {
            if let Ok(count) = retries.parse() {
                self.dispatch.retry_count = count;
            }
        }

        if let Ok(concurrency) = std::env::var("EVENT_BUS_MAX_CONCURRENT") {
            if let Ok(limit) = concurrency.parse() {
                self.dispatch.max_concurrent_dispatches = limit;
            }
        }
    }
}
