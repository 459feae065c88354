// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues and queue bindings, including the arguments RabbitMQ
//! uses for queue mode and dead-lettering.

use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument selecting the queue mode (`default` or `lazy`)
pub const AMQP_HEADERS_QUEUE_MODE: &str = "x-queue-mode";
/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key of dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Arguments are stored as AMQP long strings, which is how they were
/// originally declared on existing brokers. Changing the value type would make
/// redeclaration fail with `PRECONDITION_FAILED`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition with no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the `x-queue-mode` argument.
    pub fn queue_mode(self, mode: &str) -> Self {
        self.string_arg(AMQP_HEADERS_QUEUE_MODE, mode)
    }

    /// Routes rejected and expired messages to `exchange`.
    pub fn dead_letter_exchange(self, exchange: &str) -> Self {
        self.string_arg(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, exchange)
    }

    /// Overrides the routing key used when a message is dead-lettered.
    pub fn dead_letter_routing_key(self, key: &str) -> Self {
        self.string_arg(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, key)
    }

    fn string_arg(mut self, key: &str, value: &str) -> Self {
        self.args.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn args(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.args
    }

    /// Returns a string argument, if present.
    pub fn arg(&self, key: &str) -> Option<String> {
        match self.args.get(key) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            Some(AMQPValue::ShortString(value)) => Some(value.to_string()),
            _ => None,
        }
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
