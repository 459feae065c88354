// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Group
//!
//! Runs a fixed number of consumers on one channel. Each consumer gets its own
//! tag, its own delivery stream and its own tokio task, so no two tasks ever
//! see the same delivery. Ordering holds per consumer only; the broker
//! round-robins between consumers of the same queue.
//!
//! Stopping is cooperative: tasks finish the delivery in hand and exit. Tasks
//! still busy after `channel_notify_timeout` are aborted and the channel is
//! force-closed, which makes the broker requeue whatever they held.

use crate::{
    channel::apply_flow_control,
    config::ConsumerConfig,
    consumer::{consume, ConsumerContext},
    errors::AmqpError,
    handler::ConsumerHandler,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::{
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub struct ConsumerGroup {
    channel: Arc<dyn BrokerChannel>,
    tags: Vec<String>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl ConsumerGroup {
    /// Applies the prefetch limit and starts one consumer per tag.
    ///
    /// If any consumer fails to register, the ones already started are torn
    /// down, the channel is closed and the error is returned.
    ///
    /// # Parameters
    /// * `channel` - Channel owned by the group from now on
    /// * `queue` - Queue to consume from, already declared
    /// * `config` - Consumer count, tag prefix, prefetch and content type filter
    /// * `handler` - Called once per accepted delivery
    ///
    /// # Returns
    /// * `Result<ConsumerGroup, AmqpError>` - The running group, or the first
    ///   qos or registration failure
    pub async fn start(
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        config: &ConsumerConfig,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerGroup, AmqpError> {
        config.validate()?;
        apply_flow_control(channel.as_ref(), config.prefetch_count).await?;

        let tags = config.consumer_tags();
        let (stop, _) = watch::channel(false);
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(tags.len());

        for tag in &tags {
            let deliveries = match channel.consume(queue, tag).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = err.to_string(), consumer = tag, "failure to create the consumer");
                    stop.send_replace(true);
                    for worker in &workers {
                        worker.abort();
                    }
                    if let Err(close_err) = channel.close().await {
                        debug!(error = close_err.to_string(), "failure to close consumer channel");
                    }
                    return Err(err);
                }
            };

            let ctx = ConsumerContext {
                queue: queue.to_owned(),
                consumer_tag: tag.clone(),
                content_type: config.expected_content_type().map(str::to_owned),
                handler: handler.clone(),
            };
            workers.push(tokio::spawn(run_consumer(ctx, deliveries, stop.subscribe())));
        }

        info!(queue, consumers = tags.len(), "consumer group started");

        Ok(ConsumerGroup {
            channel,
            tags,
            stop,
            workers: Mutex::new(workers),
            drain_timeout: config.channel_notify_timeout,
        })
    }

    pub fn consumer_tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow()
    }

    /// Stops every consumer and closes the channel.
    ///
    /// Safe to call concurrently and more than once; only the first call
    /// waits for the drain.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.stop.send_replace(true);

        let workers = match self.workers.lock() {
            Ok(mut guard) => mem::take(&mut *guard),
            Err(_) => return Err(AmqpError::InternalError),
        };
        if workers.is_empty() {
            return Ok(());
        }

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        match tokio::time::timeout(self.drain_timeout, join_all(workers)).await {
            Ok(results) => {
                for res in results {
                    if let Err(err) = res {
                        error!(error = err.to_string(), "consumer task ended abnormally");
                    }
                }
                debug!("consumers drained");
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "consumers did not drain in time, abandoning them"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        if let Err(err) = self.channel.close().await {
            debug!(error = err.to_string(), "failure to close consumer channel");
        }

        Ok(())
    }
}

impl Drop for ConsumerGroup {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn run_consumer(
    ctx: ConsumerContext,
    mut deliveries: DeliveryStream,
    mut stop: watch::Receiver<bool>,
) {
    let tracer = global::tracer("amqp consumer");
    debug!(consumer = ctx.consumer_tag, "consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(err) = consume(&tracer, &ctx, &delivery).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => {
                debug!(consumer = ctx.consumer_tag, "delivery stream closed");
                break;
            }
        }
    }

    debug!(consumer = ctx.consumer_tag, "consumer stopped");
}
