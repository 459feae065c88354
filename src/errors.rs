// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Session
//!
//! `AmqpError` covers every failure the session manager can surface: dialing,
//! channel provisioning, topology declaration, consumer registration and the
//! terminal states of the connection supervisor.
//!
//! Errors fall in three groups:
//! - transient connectivity faults, recovered internally up to the reconnect policy
//! - topology faults, which signal a configuration conflict and are never retried
//! - terminal faults, after which the supervisor refuses further work

use thiserror::Error;

/// Represents errors that can occur while managing the broker session.
///
/// Variants carry the underlying cause as a string so the type stays `Clone`
/// and comparable in tests. Causes never include the connection URI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation needed a live connection and there was none
    #[error("connection is not open")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    ConsumerDeclarationError(String, String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error closing a channel or connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// The reconnect policy ran out of attempts
    #[error("reconnection abandoned after {0} attempts")]
    ReconnectExhausted(u32),

    /// The supervisor already gave up reconnecting
    #[error("connection supervisor is in a failed state")]
    SupervisorFailed,

    /// The supervisor was shut down on purpose
    #[error("connection supervisor was shut down")]
    ShutDown,

    /// Configuration rejected before touching the broker
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AmqpError {
    /// Faults that a fresh connect and provisioning cycle may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::NotConnected
                | AmqpError::ChannelError(_)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError(_, _)
        )
    }

    /// Broker-side declaration conflicts. These need an operator.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_, _)
                | AmqpError::DeclareQueueError(_, _)
                | AmqpError::BindingExchangeToQueueError(_, _, _)
        )
    }

    /// Errors after which the session will not recover on its own.
    pub fn is_terminal(&self) -> bool {
        self.is_topology()
            || matches!(
                self,
                AmqpError::ReconnectExhausted(_)
                    | AmqpError::SupervisorFailed
                    | AmqpError::ShutDown
                    | AmqpError::InvalidConfig(_)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connectivity_faults_as_transient() {
        assert!(AmqpError::ConnectionError("refused".into()).is_transient());
        assert!(AmqpError::NotConnected.is_transient());
        assert!(AmqpError::ChannelError("closing".into()).is_transient());
        assert!(!AmqpError::NotConnected.is_terminal());
    }

    #[test]
    fn topology_conflicts_are_terminal_and_not_transient() {
        let err = AmqpError::DeclareQueueError("orders".into(), "PRECONDITION_FAILED".into());
        assert!(err.is_topology());
        assert!(err.is_terminal());
        assert!(!err.is_transient());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError(
            "orders-exchange".into(),
            "orders".into(),
            "NOT_FOUND".into(),
        );
        assert_eq!(
            err.to_string(),
            "failure to bind queue `orders` to exchange `orders-exchange`: NOT_FOUND"
        );
    }
}
