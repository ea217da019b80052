// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! Every worker and the topology provisioner obtain their connection through a
//! [`ConnectionBuilder`]. The builder retries only when the broker host refused the
//! TCP connection (the broker is still starting, or restarting); any other failure,
//! such as bad credentials or an unknown virtual host, is returned on the first
//! attempt.
//!
//! The delay before retry `n` is `n × backoff_step`, so with the defaults the
//! builder waits 2s, 4s, 6s, 8s and 10s, making six attempts in total.

use crate::errors::{AmqpError, ConnectError};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{error::Error as StdError, io, time::Duration};
use tracing::{debug, error, warn};

/// Where and how to reach the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub automatic_recovery: bool,
}

impl BrokerEndpoint {
    /// Renders the AMQP URI for this endpoint.
    ///
    /// The virtual host is percent-encoded, so the default `/` vhost becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('%', "%25").replace('/', "%2f")
        )
    }
}

impl std::fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("automatic_recovery", &self.automatic_recovery)
            .finish_non_exhaustive()
    }
}

/// Opens a single transport connection. One call is one attempt.
#[cfg_attr(test, mockall::automock(type Connection = String;))]
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Self::Connection, ConnectError>;
}

/// [`Connector`] backed by `lapin`.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> Self {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    type Connection = Connection;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Connection, ConnectError> {
        if endpoint.automatic_recovery {
            debug!("automatic recovery requested, reconnects are handled by the connection builder");
        }

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        Connection::connect(&endpoint.uri(), options)
            .await
            .map_err(|err| classify(&err))
    }
}

/// Maps a lapin error onto the retry classification.
pub fn classify(err: &lapin::Error) -> ConnectError {
    let refused = match err {
        lapin::Error::IOError(io_err) => refused_in_chain(io_err.as_ref()),
        other => refused_in_chain(other),
    };

    if refused {
        ConnectError::Refused(err.to_string())
    } else {
        ConnectError::Fatal(err.to_string())
    }
}

/// Walks the cause chain looking for an `io::Error` of kind `ConnectionRefused`.
///
/// `io::Error::source` skips the error wrapped by `io::Error::new`, so wrapped
/// payloads are followed through `get_ref` instead.
pub fn refused_in_chain(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);

    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }

            if let Some(inner) = io_err.get_ref() {
                current = Some(inner as &(dyn StdError + 'static));
                continue;
            }
        }

        current = err.source();
    }

    false
}

/// How many times and how slowly to retry a refused connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            backoff_step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_step: Duration) -> Self {
        RetryPolicy {
            max_retries,
            backoff_step,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay slept after the `attempt`-th failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Connects through a [`Connector`] applying a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C> ConnectionBuilder<C>
where
    C: Connector,
{
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        ConnectionBuilder { connector, policy }
    }

    /// Returns a live connection or the error that ended the attempts.
    ///
    /// # Errors
    /// * [`AmqpError::ConnectionError`] on the first non-refused failure
    /// * [`AmqpError::RetryExhausted`] once every attempt was refused
    pub async fn build(&self, endpoint: &BrokerEndpoint) -> Result<C::Connection, AmqpError> {
        let max_attempts = self.policy.max_attempts();

        for attempt in 1..=max_attempts {
            debug!(attempt, host = endpoint.host.as_str(), "creating amqp connection...");

            match self.connector.connect(endpoint).await {
                Ok(conn) => {
                    debug!(attempt, "amqp connected");
                    return Ok(conn);
                }
                Err(ConnectError::Fatal(reason)) => {
                    error!(error = reason.as_str(), attempt, "failure to connect");
                    return Err(AmqpError::ConnectionError(reason));
                }
                Err(ConnectError::Refused(reason)) if attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        error = reason.as_str(),
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "broker unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ConnectError::Refused(reason)) => {
                    error!(error = reason.as_str(), attempt, "broker unreachable, giving up");
                }
            }
        }

        Err(AmqpError::RetryExhausted {
            attempts: max_attempts,
        })
    }
}
