// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Interface
//!
//! The application plugs its message processing in through `ConsumerHandler`.
//! A handler is called once per accepted delivery, from the consumer task that
//! received it, and decides whether the delivery is acknowledged (`Ok`) or
//! requeued (`Err`).

use async_trait::async_trait;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::Context;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure reported by a handler. The delivery is requeued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerMessage<'m> {
    pub queue: &'m str,
    pub consumer_tag: &'m str,
    pub exchange: &'m str,
    pub routing_key: &'m str,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub content_type: Option<&'m str>,
    pub msg_type: Option<&'m str>,
    pub message_id: Option<&'m str>,
    pub headers: &'m BTreeMap<ShortString, AMQPValue>,
    pub data: &'m [u8],
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message. `ctx` carries the trace context propagated by
    /// the producer, if any.
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError>;
}
