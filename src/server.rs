// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Server
//!
//! `Server` keeps a consumer session alive on top of a `ConnectionSupervisor`.
//! Becoming ready means: a live connection, a fresh channel, the declared
//! topology and a running consumer group. `run` repeats that sequence after
//! every unexpected connection loss until shutdown or a fatal error.
//!
//! Provisioning is serialized by a gate, so while a reconnect is in progress
//! nothing else opens channels on the stale connection.

use crate::{
    amqp::LapinDialer,
    channel::open_channel,
    config::{BrokerConfig, ServerConfig},
    connection::{ConnectionState, ConnectionSupervisor},
    errors::AmqpError,
    group::ConsumerGroup,
    handler::ConsumerHandler,
    topology::TopologyDeclarer,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub struct Server {
    config: ServerConfig,
    supervisor: Arc<ConnectionSupervisor>,
    handler: Arc<dyn ConsumerHandler>,
    consumers: Mutex<Option<Arc<ConsumerGroup>>>,
    gate: tokio::sync::Mutex<()>,
}

impl Server {
    /// Creates a server on top of an existing supervisor.
    ///
    /// # Parameters
    /// * `config` - Topology, consumer settings and reconnect policy
    /// * `supervisor` - Owns the broker connection, shared with nobody else
    /// * `handler` - Called for every accepted delivery
    ///
    /// # Returns
    /// * `Result<Server, AmqpError>` - `InvalidConfig` when `config` does not validate
    pub fn new(
        config: ServerConfig,
        supervisor: Arc<ConnectionSupervisor>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Server, AmqpError> {
        config.validate()?;

        Ok(Server {
            config,
            supervisor,
            handler,
            consumers: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Builds a server talking to a real broker through lapin, with a
    /// supervisor using `config.reconnect`.
    ///
    /// # Example
    /// ```ignore
    /// let server = Server::connect(BrokerConfig::from_env()?, config, handler)?;
    /// server.run().await?;
    /// ```
    pub fn connect(
        broker: BrokerConfig,
        config: ServerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Server, AmqpError> {
        broker.validate()?;

        let dialer = Arc::new(LapinDialer::new(&broker.connection_name()));
        let supervisor = ConnectionSupervisor::new(broker, config.reconnect, dialer);
        Server::new(config, Arc::new(supervisor), handler)
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Tags of the running consumers, empty when none are running.
    pub fn consumer_tags(&self) -> Vec<String> {
        self.current_group()
            .map(|group| group.consumer_tags().to_vec())
            .unwrap_or_default()
    }

    /// Connects if needed, then opens a channel, declares the topology and
    /// starts the consumers. Consumers from a previous pass are stopped first.
    ///
    /// Dial failures and transient provisioning failures are retried under the
    /// reconnect policy; topology conflicts are returned at once.
    pub async fn ensure_ready(&self) -> Result<(), AmqpError> {
        self.bring_up(false).await
    }

    /// Keeps the session alive until shutdown.
    ///
    /// Returns `Ok` after `shutdown`, or the fatal error that ended the
    /// session: exhausted reconnects or a topology conflict.
    pub async fn run(&self) -> Result<(), AmqpError> {
        let mut shutdown = self.supervisor.shutdown_signal();

        match self.ensure_ready().await {
            Err(AmqpError::ShutDown) => return Ok(()),
            result => result?,
        }

        loop {
            match self.supervisor.watch_closure().await {
                Ok(signal) => {
                    tokio::select! {
                        reason = signal.closed() => {
                            warn!(reason, "connection closure detected");
                        }
                        _ = shutdown.wait_for(|requested| *requested) => return Ok(()),
                    }
                }
                Err(AmqpError::NotConnected) => {
                    debug!("connection lost before watching it");
                }
                Err(err) => return Err(err),
            }

            if self.supervisor.is_shut_down() {
                debug!("closure observed after shutdown, not reconnecting");
                return Ok(());
            }
            self.supervisor.report_closure();

            match self.bring_up(true).await {
                Ok(()) => info!("session restored"),
                Err(AmqpError::ShutDown) => return Ok(()),
                Err(err) => {
                    error!(error = err.to_string(), "session lost");
                    return Err(err);
                }
            }
        }
    }

    /// Stops the consumers and closes the connection. Idempotent.
    ///
    /// Intent is recorded first, so a provisioning pass in flight backs off
    /// before the gate is taken here.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        info!("shutting down consumer server");
        self.supervisor.request_shutdown();

        let _gate = self.gate.lock().await;
        self.stop_consumers().await;
        self.supervisor.shutdown().await
    }

    /// Dials and provisions until a consumer group runs.
    ///
    /// Dial failures and transient provisioning failures draw on the same
    /// attempt budget. Running out of it discards the connection and leaves
    /// the supervisor `Failed`.
    async fn bring_up(&self, redial: bool) -> Result<(), AmqpError> {
        let _gate = self.gate.lock().await;
        self.stop_consumers().await;

        let policy = *self.supervisor.policy();
        let mut redial = redial;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let dialed = if redial {
                self.supervisor.redial().await
            } else {
                self.supervisor.connect().await
            };

            let err = match dialed {
                Ok(()) => match self.provision().await {
                    Ok(group) => {
                        if self.supervisor.is_shut_down() {
                            if let Err(err) = group.stop().await {
                                error!(error = err.to_string(), "failure to stop consumers");
                            }
                            return Err(AmqpError::ShutDown);
                        }
                        if attempt > 1 {
                            info!(attempt, "session provisioned");
                        }
                        self.set_group(Some(Arc::new(group)));
                        return Ok(());
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };

            if matches!(err, AmqpError::ShutDown) {
                return Err(err);
            }
            if !err.is_transient() {
                error!(error = err.to_string(), "provisioning failed");
                return Err(err);
            }

            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                error = err.to_string(),
                "session setup failed"
            );
            self.supervisor.discard().await;
            if policy.is_exhausted(attempt) {
                return Err(self.supervisor.give_up(attempt).await);
            }
            self.supervisor.backoff().await?;
            redial = true;
        }
    }

    async fn provision(&self) -> Result<ConsumerGroup, AmqpError> {
        let connection = self.supervisor.current().await?;
        let channel = open_channel(connection.as_ref()).await?;

        TopologyDeclarer::new(&self.config.topology)
            .declare(channel.as_ref())
            .await?;

        ConsumerGroup::start(
            channel,
            &self.config.topology.queue_name,
            &self.config.consumer,
            self.handler.clone(),
        )
        .await
    }

    async fn stop_consumers(&self) {
        let group = match self.consumers.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(group) = group {
            if let Err(err) = group.stop().await {
                error!(error = err.to_string(), "failure to stop consumers");
            }
        }
    }

    fn current_group(&self) -> Option<Arc<ConsumerGroup>> {
        self.consumers.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_group(&self, group: Option<Arc<ConsumerGroup>>) {
        if let Ok(mut guard) = self.consumers.lock() {
            *guard = group;
        }
    }
}
