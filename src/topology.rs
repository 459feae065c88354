// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the broker-side objects a consumer session relies on: the primary
//! exchange, the primary queue, the optional dead-letter exchange and queue,
//! and the bindings between them.
//!
//! Declaration is idempotent. Running it again on a fresh channel against
//! the same broker state succeeds without changing anything. A broker-side
//! object with the same name but different parameters is a configuration
//! conflict and is reported as-is, never retried.

use crate::{
    config::TopologyConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use tracing::{debug, error, warn};

/// Builds and installs the topology described by a `TopologyConfig`.
pub struct TopologyDeclarer<'tp> {
    config: &'tp TopologyConfig,
}

impl<'tp> TopologyDeclarer<'tp> {
    pub fn new(config: &'tp TopologyConfig) -> TopologyDeclarer<'tp> {
        TopologyDeclarer { config }
    }

    /// The primary exchange: durable, never auto-deleted.
    pub fn exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.config.exchange_name)
            .kind(self.config.exchange_type.clone())
            .durable()
    }

    /// The primary queue with its mode and dead-letter arguments.
    ///
    /// `x-dead-letter-exchange` is set to the dead-letter *exchange* name.
    /// Earlier deployments set it to the dead-letter routing key; queues
    /// declared that way conflict with this definition and have to be
    /// migrated on the broker.
    pub fn queue(&self) -> QueueDefinition {
        let cfg = self.config;
        let mut def = QueueDefinition::new(&cfg.queue_name)
            .durable()
            .queue_mode(&cfg.queue_mode);

        if cfg.has_dead_letter_exchange() {
            def = def.dead_letter_exchange(&cfg.dead_letter_exchange);
            if !cfg.dead_letter_routing_key.is_empty() {
                def = def.dead_letter_routing_key(&cfg.dead_letter_routing_key);
            }
        }

        def
    }

    pub fn binding(&self) -> QueueBinding {
        QueueBinding::new(&self.config.queue_name)
            .exchange(&self.config.exchange_name)
            .routing_key(&self.config.routing_key)
    }

    /// Dead-letter exchange, if one is configured.
    pub fn dead_letter_exchange(&self) -> Option<ExchangeDefinition> {
        if !self.config.has_dead_letter_exchange() {
            return None;
        }

        Some(
            ExchangeDefinition::new(&self.config.dead_letter_exchange)
                .kind(self.config.dead_letter_exchange_type.clone())
                .durable(),
        )
    }

    /// Dead-letter queue and its binding, if both the exchange and the queue
    /// are configured. Without an override, dead-lettered messages keep their
    /// original routing key, so the binding falls back to the primary key.
    pub fn dead_letter_queue(&self) -> Option<(QueueDefinition, QueueBinding)> {
        let cfg = self.config;
        if !cfg.has_dead_letter_exchange() || cfg.dead_letter_queue_name.is_empty() {
            return None;
        }

        let key = if cfg.dead_letter_routing_key.is_empty() {
            &cfg.routing_key
        } else {
            &cfg.dead_letter_routing_key
        };

        Some((
            QueueDefinition::new(&cfg.dead_letter_queue_name)
                .durable()
                .queue_mode(&cfg.queue_mode),
            QueueBinding::new(&cfg.dead_letter_queue_name)
                .exchange(&cfg.dead_letter_exchange)
                .routing_key(key),
        ))
    }

    /// Installs the topology on `channel`.
    ///
    /// Order: primary exchange, dead-letter exchange, dead-letter queue and
    /// binding, primary queue, primary binding. The dead-letter side goes
    /// first so the primary queue never points at a missing exchange.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if !self.config.has_dead_letter_exchange() && !self.config.dead_letter_routing_key.is_empty()
        {
            warn!(
                queue = self.config.queue_name,
                "dead letter routing key ignored without a dead letter exchange"
            );
        }

        self.install_exchange(channel, &self.exchange()).await?;

        if let Some(dlx) = self.dead_letter_exchange() {
            self.install_exchange(channel, &dlx).await?;
        }

        if let Some((dlq, binding)) = self.dead_letter_queue() {
            self.install_queue(channel, &dlq).await?;
            self.binding_queue(channel, &binding).await?;
        }

        self.install_queue(channel, &self.queue()).await?;
        self.binding_queue(channel, &self.binding()).await
    }

    async fn install_exchange(
        &self,
        channel: &dyn BrokerChannel,
        exch: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name());

        match channel.exchange_declare(exch).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => {
                debug!("exchange: {} was created", exch.name());
                Ok(())
            }
        }
    }

    async fn install_queue(
        &self,
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        match channel.queue_declare(def).await {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(err)
            }
            _ => {
                debug!("queue: {} was created", def.name());
                Ok(())
            }
        }
    }

    async fn binding_queue(
        &self,
        channel: &dyn BrokerChannel,
        binding: &QueueBinding,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );

        match channel.queue_bind(binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}
