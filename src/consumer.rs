// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles one delivery on behalf of a consumer task: filters on content type,
//! runs the handler inside a consumer span and settles the delivery with the
//! broker.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    transport::Delivery,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Handler succeeded, delivery acked.
    Acked,
    /// Content type mismatch, nacked without requeue.
    Rejected,
    /// Handler failed, nacked with requeue.
    Requeued,
}

/// Everything a consumer task needs to process its deliveries.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) content_type: Option<String>,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl ConsumerContext {
    fn accepts(&self, delivery: &Delivery) -> bool {
        match (&self.content_type, &delivery.content_type) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        }
    }
}

/// Processes a single delivery.
///
/// A handler failure is not an error here: the delivery is requeued and the
/// consumer keeps going. Errors are only returned when the broker refuses the
/// settlement itself.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    ctx: &ConsumerContext,
    delivery: &Delivery,
) -> Result<Outcome, AmqpError> {
    let span_name = delivery.msg_type.as_deref().unwrap_or(&ctx.queue);
    let (otel_ctx, mut span) = otel::new_span(&delivery.headers, tracer, span_name);

    debug!(
        consumer = ctx.consumer_tag,
        delivery_tag = delivery.delivery_tag,
        "received - exchange: {}",
        delivery.exchange,
    );

    if !ctx.accepts(delivery) {
        let msg = "rejecting message - reason: unexpected content type";
        warn!(
            consumer = ctx.consumer_tag,
            expected = ctx.content_type.as_deref().unwrap_or_default(),
            received = delivery.content_type.as_deref().unwrap_or_default(),
            "{}",
            msg
        );
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        if let Err(e) = delivery.nack(false).await {
            error!(error = e.to_string(), "error whiling nack msg");
            span.record_error(&e);
            return Err(e);
        }
        return Ok(Outcome::Rejected);
    }

    let msg = ConsumerMessage {
        queue: &ctx.queue,
        consumer_tag: &ctx.consumer_tag,
        exchange: &delivery.exchange,
        routing_key: &delivery.routing_key,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        content_type: delivery.content_type.as_deref(),
        msg_type: delivery.msg_type.as_deref(),
        message_id: delivery.message_id.as_deref(),
        headers: &delivery.headers,
        data: &delivery.data,
    };

    match ctx.handler.exec(&otel_ctx, &msg).await {
        Ok(()) => {
            debug!("message successfully processed");
            match delivery.ack().await {
                Err(e) => {
                    error!(error = e.to_string(), "error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(e)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(Outcome::Acked)
                }
            }
        }
        Err(handler_err) => {
            warn!(
                consumer = ctx.consumer_tag,
                error = handler_err.to_string(),
                "error whiling handling msg, requeuing"
            );
            span.record_error(&handler_err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            match delivery.nack(true).await {
                Err(e) => {
                    error!(error = e.to_string(), "error whiling requeuing");
                    span.record_error(&e);
                    Err(e)
                }
                _ => Ok(Outcome::Requeued),
            }
        }
    }
}
