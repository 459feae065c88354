// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Provisioning
//!
//! Opens channels on the supervised connection and applies their flow-control
//! settings. Neither operation retries: a failure here means the connection is
//! going away, and recovering is the job of a fresh connect cycle.

use crate::{
    errors::AmqpError,
    transport::{BrokerChannel, BrokerConnection},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Opens a new channel on `connection`.
///
/// Fails fast with `ChannelError` when the connection is no longer usable,
/// without asking the broker.
pub async fn open_channel(
    connection: &dyn BrokerConnection,
) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
    if !connection.is_connected() {
        error!("refusing to open a channel on a closed connection");
        return Err(AmqpError::ChannelError("connection is not open".to_owned()));
    }

    let channel = connection.open_channel().await?;
    debug!("channel ready");

    Ok(channel)
}

/// Caps how many unacknowledged deliveries the broker pushes to each
/// consumer on `channel`. Zero means unlimited.
pub async fn apply_flow_control(
    channel: &dyn BrokerChannel,
    prefetch_count: u16,
) -> Result<(), AmqpError> {
    match channel.basic_qos(prefetch_count).await {
        Err(err) => {
            error!(error = err.to_string(), prefetch_count, "failure to configure qos");
            Err(err)
        }
        _ => {
            debug!(prefetch_count, "qos configured");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeBroker;

    #[tokio::test]
    async fn opens_channel_on_live_connection() {
        let broker = FakeBroker::default();
        let conn = broker.connection();

        let channel = open_channel(&*conn).await.unwrap();

        assert!(channel.is_open());
        assert_eq!(broker.state().channels_opened, 1);
    }

    #[tokio::test]
    async fn fails_fast_on_closed_connection() {
        let broker = FakeBroker::default();
        let conn = broker.connection();
        conn.drop_connection("socket reset");

        let err = open_channel(&*conn).await.err();

        assert!(matches!(err, Some(AmqpError::ChannelError(_))));
        assert_eq!(broker.state().channels_opened, 0);
    }

    #[tokio::test]
    async fn propagates_broker_refusal() {
        let broker = FakeBroker::default();
        let conn = broker.connection();
        conn.refuse_channels();

        let err = open_channel(&*conn).await.err();
        assert_eq!(
            err,
            Some(AmqpError::ChannelError("channel limit reached".to_owned()))
        );
    }

    #[tokio::test]
    async fn qos_failure_is_returned_not_retried() {
        let broker = FakeBroker::default();
        let channel = broker.channel();
        channel.close().await.unwrap();

        let err = apply_flow_control(&*channel, 10).await.err();

        assert!(matches!(err, Some(AmqpError::QoSDeclarationError(_))));
        assert!(broker.state().qos.is_empty());
    }

    #[tokio::test]
    async fn applies_prefetch() {
        let broker = FakeBroker::default();
        let channel = broker.channel();

        apply_flow_control(&*channel, 25).await.unwrap();
        assert_eq!(broker.state().qos, vec![25]);
    }
}
