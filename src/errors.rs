// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Harness
//!
//! `AmqpError` covers every failure a worker, the provisioner or the orchestrator
//! can surface. `ConnectError` is the narrower type returned by the transport seam
//! (see [`crate::connection::Connector`]) so that the connection builder can tell a
//! refused connection apart from everything else without looking at error text.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant maps to one step of the harness lifecycle: connecting, opening a
/// channel, declaring the topology, publishing, consuming and acknowledging.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Configuration could not be loaded or deserialized
    #[error("failure to load configuration: {0}")]
    ConfigError(String),

    /// Non-retryable error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Every connection attempt failed with a refused connection
    #[error("could not connect after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish message `{0}`")]
    PublishingError(u64),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error processing a received message
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// Error reading from the delivery stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Failure reported by a [`crate::connection::Connector`] for a single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The broker host actively refused the TCP connection. Retried.
    #[error("connection refused: {0}")]
    Refused(String),

    /// Authentication, virtual host, protocol or any other failure. Not retried.
    #[error("{0}")]
    Fatal(String),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Refused(_))
    }
}
