// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Implementations of the transport traits on top of `lapin`. This is the only
//! module that touches the AMQP client library directly.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ClosureSignal, Delivery, DeliveryAcker, DeliveryStream,
        Dialer,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Dials the broker with `lapin`.
pub struct LapinDialer {
    connection_name: String,
}

impl LapinDialer {
    pub fn new(connection_name: &str) -> Self {
        LapinDialer {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(name = self.connection_name, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (notifier, signal) = ClosureSignal::channel();
        conn.on_error(move |err| notifier.notify(err.to_string()));

        Ok(Arc::new(LapinConnection { inner: conn, signal }))
    }
}

pub struct LapinConnection {
    inner: Connection,
    signal: ClosureSignal,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn closure_signal(&self) -> ClosureSignal {
        self.signal.clone()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "session shutdown")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(def.params().clone()),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name().to_owned(), err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::from(def.args().clone()),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(def.name().to_owned(), err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                    err.to_string(),
                )
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::ConsumerDeclarationError(consumer_tag.to_owned(), err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "consumers stopped")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let content_type = props.content_type().as_ref().map(|v| v.to_string());
    let msg_type = props.kind().as_ref().map(|v| v.to_string());
    let message_id = props.message_id().as_ref().map(|v| v.to_string());
    let headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    let mut out = Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Arc::new(LapinAcker(delivery.acker)),
    )
    .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str());
    out.redelivered = delivery.redelivered;
    out.content_type = content_type;
    out.msg_type = msg_type;
    out.message_id = message_id;
    out.headers = headers;
    out
}
