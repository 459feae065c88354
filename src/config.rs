// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Configuration
//!
//! Configuration structures consumed by the session manager:
//! - `BrokerConfig`: where to connect
//! - `TopologyConfig`: which exchange, queue and dead-letter objects to declare
//! - `ConsumerConfig`: how many consumers to run and their flow-control ceiling
//! - `ReconnectPolicy`: how hard to try after the connection is lost
//!
//! All of them deserialize with `serde`, durations are expressed in
//! milliseconds. `ServerConfig` bundles the per-server parts and can be read
//! from JSON.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use serde::{Deserialize, Deserializer};
use std::{env, fmt, time::Duration};
use uuid::Uuid;

pub const DEFAULT_SCHEME: &str = "amqp";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_QUEUE_MODE: &str = "default";

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Connection target for the broker.
///
/// Immutable once built. The password is kept out of `Debug` output and out
/// of every URI meant for logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "BrokerConfig::default_scheme")]
    scheme: String,
    username: String,
    password: String,
    host: String,
    #[serde(default = "BrokerConfig::default_port")]
    port: u16,
    #[serde(default)]
    connection_name: String,
}

impl BrokerConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        BrokerConfig {
            scheme: DEFAULT_SCHEME.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            host: host.to_owned(),
            port,
            connection_name: String::new(),
        }
    }

    /// Switches the URI scheme, e.g. to `amqps`.
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_owned();
        self
    }

    /// Sets the name reported to the broker for this connection.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Reads `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `RABBITMQ_SCHEME` and `RABBITMQ_CONNECTION_NAME`.
    pub fn from_env() -> Result<Self, AmqpError> {
        let port = match env::var("RABBITMQ_PORT") {
            Ok(port) => port.parse::<u16>().map_err(|_| {
                AmqpError::InvalidConfig(format!("RABBITMQ_PORT `{}` is not a port", port))
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let config = BrokerConfig {
            scheme: env::var("RABBITMQ_SCHEME").unwrap_or_else(|_| DEFAULT_SCHEME.to_owned()),
            username: env::var("RABBITMQ_USER").unwrap_or_else(|_| "guest".to_owned()),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or_else(|_| "guest".to_owned()),
            host: env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_owned()),
            port,
            connection_name: env::var("RABBITMQ_CONNECTION_NAME").unwrap_or_default(),
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.scheme.is_empty() {
            return Err(AmqpError::InvalidConfig("broker scheme is empty".to_owned()));
        }
        if self.host.is_empty() {
            return Err(AmqpError::InvalidConfig("broker host is empty".to_owned()));
        }
        Ok(())
    }

    /// Full connection string, credentials included. Never log it.
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}@{}:{}",
            self.scheme, self.username, self.password, self.host, self.port
        )
    }

    /// Connection string safe for logs.
    pub fn redacted_uri(&self) -> String {
        format!(
            "{}://{}:***@{}:{}",
            self.scheme, self.username, self.host, self.port
        )
    }

    /// Name reported to the broker, generated when none is configured.
    pub fn connection_name(&self) -> String {
        if self.connection_name.is_empty() {
            format!("rabbitmq-session-{}", Uuid::new_v4())
        } else {
            self.connection_name.clone()
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn default_scheme() -> String {
        DEFAULT_SCHEME.to_owned()
    }

    fn default_port() -> u16 {
        DEFAULT_PORT
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

/// Bounds the reconnect loop. `max_attempts == 0` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "ReconnectPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "ReconnectPolicy::default_interval",
        deserialize_with = "deserialize_millis"
    )]
    pub interval: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        ReconnectPolicy {
            max_attempts,
            interval,
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        ReconnectPolicy::new(0, interval)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }

    /// True once `attempts` failed attempts use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        !self.is_unbounded() && attempts >= self.max_attempts
    }

    fn default_max_attempts() -> u32 {
        10
    }

    fn default_interval() -> Duration {
        Duration::from_secs(1)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::new(
            ReconnectPolicy::default_max_attempts(),
            ReconnectPolicy::default_interval(),
        )
    }
}

/// Desired broker-side objects.
///
/// Empty dead-letter fields mean "not configured".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopologyConfig {
    pub exchange_name: String,
    #[serde(default)]
    pub exchange_type: ExchangeKind,
    #[serde(default)]
    pub routing_key: String,
    pub queue_name: String,
    #[serde(default)]
    pub dead_letter_exchange: String,
    #[serde(default)]
    pub dead_letter_exchange_type: ExchangeKind,
    #[serde(default)]
    pub dead_letter_routing_key: String,
    #[serde(default)]
    pub dead_letter_queue_name: String,
    #[serde(default = "TopologyConfig::default_queue_mode")]
    pub queue_mode: String,
}

impl TopologyConfig {
    pub fn new(exchange_name: &str, queue_name: &str, routing_key: &str) -> Self {
        TopologyConfig {
            exchange_name: exchange_name.to_owned(),
            exchange_type: ExchangeKind::Direct,
            routing_key: routing_key.to_owned(),
            queue_name: queue_name.to_owned(),
            dead_letter_exchange: String::new(),
            dead_letter_exchange_type: ExchangeKind::Direct,
            dead_letter_routing_key: String::new(),
            dead_letter_queue_name: String::new(),
            queue_mode: DEFAULT_QUEUE_MODE.to_owned(),
        }
    }

    pub fn with_exchange_type(mut self, kind: ExchangeKind) -> Self {
        self.exchange_type = kind;
        self
    }

    pub fn with_queue_mode(mut self, mode: &str) -> Self {
        self.queue_mode = mode.to_owned();
        self
    }

    pub fn with_dead_letter(mut self, exchange: &str, routing_key: &str, queue: &str) -> Self {
        self.dead_letter_exchange = exchange.to_owned();
        self.dead_letter_routing_key = routing_key.to_owned();
        self.dead_letter_queue_name = queue.to_owned();
        self
    }

    pub fn has_dead_letter_exchange(&self) -> bool {
        !self.dead_letter_exchange.is_empty()
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange_name.is_empty() {
            return Err(AmqpError::InvalidConfig("exchange name is empty".to_owned()));
        }
        if self.queue_name.is_empty() {
            return Err(AmqpError::InvalidConfig("queue name is empty".to_owned()));
        }
        if self.queue_mode.is_empty() {
            return Err(AmqpError::InvalidConfig("queue mode is empty".to_owned()));
        }
        if !self.dead_letter_queue_name.is_empty() && !self.has_dead_letter_exchange() {
            return Err(AmqpError::InvalidConfig(format!(
                "dead letter queue `{}` needs a dead letter exchange",
                self.dead_letter_queue_name
            )));
        }
        Ok(())
    }

    fn default_queue_mode() -> String {
        DEFAULT_QUEUE_MODE.to_owned()
    }
}

/// How many consumers to run and how they accept deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerConfig {
    pub consumer_name_prefix: String,
    #[serde(default = "ConsumerConfig::default_count")]
    pub consumer_count: usize,
    #[serde(default)]
    pub prefetch_count: u16,
    /// Only deliveries with this content type reach the handler. Empty accepts all.
    #[serde(default)]
    pub content_type: String,
    #[serde(
        default = "ConsumerConfig::default_notify_timeout",
        deserialize_with = "deserialize_millis"
    )]
    pub channel_notify_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(consumer_name_prefix: &str, consumer_count: usize) -> Self {
        ConsumerConfig {
            consumer_name_prefix: consumer_name_prefix.to_owned(),
            consumer_count,
            prefetch_count: 0,
            content_type: String::new(),
            channel_notify_timeout: ConsumerConfig::default_notify_timeout(),
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.channel_notify_timeout = timeout;
        self
    }

    /// The expected content type, if filtering is enabled.
    pub fn expected_content_type(&self) -> Option<&str> {
        if self.content_type.is_empty() {
            None
        } else {
            Some(&self.content_type)
        }
    }

    /// Consumer tags, one per worker, in spawn order.
    pub fn consumer_tags(&self) -> Vec<String> {
        (0..self.consumer_count)
            .map(|index| format!("{}-{}", self.consumer_name_prefix, index))
            .collect()
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.consumer_count == 0 {
            return Err(AmqpError::InvalidConfig(
                "consumer count must be at least 1".to_owned(),
            ));
        }
        if self.consumer_name_prefix.is_empty() {
            return Err(AmqpError::InvalidConfig(
                "consumer name prefix is empty".to_owned(),
            ));
        }
        Ok(())
    }

    fn default_count() -> usize {
        1
    }

    fn default_notify_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

/// Everything a `Server` needs besides the broker address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub topology: TopologyConfig,
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl ServerConfig {
    pub fn new(topology: TopologyConfig, consumer: ConsumerConfig, reconnect: ReconnectPolicy) -> Self {
        ServerConfig {
            topology,
            consumer,
            reconnect,
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        let config: ServerConfig =
            serde_json::from_str(raw).map_err(|err| AmqpError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        self.topology.validate()?;
        self.consumer.validate()
    }
}
