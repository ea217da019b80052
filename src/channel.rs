// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Sessions
//!
//! A [`Session`] is one connection plus the single channel opened on it. Each worker
//! owns exactly one session for its whole life and never shares it. Sessions must be
//! released with [`Session::close`] on every exit path; lapin does not close the
//! connection when it is dropped while the I/O loop is still running.

use crate::{
    connection::{BrokerEndpoint, ConnectionBuilder, Connector},
    errors::AmqpError,
};
use lapin::{Channel, Connection};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// An exclusively owned connection/channel pair.
pub struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Closes the channel and then the connection.
    ///
    /// Failures are logged and otherwise ignored: the session is being discarded
    /// either way.
    pub async fn close(self) {
        debug!(channel = self.channel.id(), "closing amqp session...");

        if let Err(err) = self.channel.close(REPLY_SUCCESS, "OK").await {
            warn!(error = err.to_string(), "failure to close the channel");
        }

        if let Err(err) = self.connection.close(REPLY_SUCCESS, "OK").await {
            warn!(error = err.to_string(), "failure to close the connection");
        }

        debug!("amqp session closed");
    }
}

/// Connects through `builder` and opens a channel on the new connection.
///
/// If the channel cannot be created the connection is closed before the error is
/// returned.
pub async fn open_session<C>(
    builder: &ConnectionBuilder<C>,
    endpoint: &BrokerEndpoint,
) -> Result<Session, AmqpError>
where
    C: Connector<Connection = Connection>,
{
    let connection = builder.build(endpoint).await?;

    debug!("creating amqp channel...");
    match connection.create_channel().await {
        Ok(channel) => {
            debug!(channel = channel.id(), "channel created");
            Ok(Session {
                connection,
                channel,
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            if let Err(close_err) = connection.close(REPLY_SUCCESS, "OK").await {
                warn!(error = close_err.to_string(), "failure to close the connection");
            }
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}
