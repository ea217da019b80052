// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Worker
//!
//! Each producer owns its session and publishes sequence numbers `1..=count` in
//! order. Numbering restarts at 1 for every producer, so a sequence number only
//! identifies a message together with the producer that sent it.

use crate::{
    channel::open_session,
    connection::{BrokerEndpoint, ConnectionBuilder, Connector},
    errors::AmqpError,
    message::{Coordinates, PublishMessage},
    publisher::{Publisher, RabbitMQPublisher},
    topology::TopologyPlan,
};
use lapin::Connection;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ProducerWorker<P> {
    id: usize,
    publisher: P,
    count: u64,
}

impl<P> ProducerWorker<P>
where
    P: Publisher,
{
    pub fn new(id: usize, publisher: P, count: u64) -> Self {
        ProducerWorker {
            id,
            publisher,
            count,
        }
    }

    /// Publishes the whole sequence and returns how many messages were sent.
    ///
    /// Stops early, without error, once `shutdown` reads `true`. The first publish
    /// failure ends the run.
    pub async fn run(&self, shutdown: &watch::Receiver<bool>) -> Result<u64, AmqpError> {
        debug!(producer = self.id, count = self.count, "producer started");

        let mut sent = 0;
        for sequence in 1..=self.count {
            let stop = *shutdown.borrow();
            if stop {
                warn!(producer = self.id, sent, "producer interrupted by shutdown");
                break;
            }

            self.publisher
                .publish(&PublishMessage::sequenced(sequence))
                .await?;
            sent += 1;
        }

        info!(producer = self.id, sent, "messages sent to the exchange");
        Ok(sent)
    }
}

/// Opens a session, runs one producer on it and closes the session afterwards.
pub async fn run_producer<C>(
    id: usize,
    builder: &ConnectionBuilder<C>,
    endpoint: &BrokerEndpoint,
    plan: &TopologyPlan,
    count: u64,
    shutdown: watch::Receiver<bool>,
) -> Result<u64, AmqpError>
where
    C: Connector<Connection = Connection>,
{
    let session = open_session(builder, endpoint).await?;

    let publisher = RabbitMQPublisher::new(
        session.channel().clone(),
        plan.exchange_name(),
        plan.routing_key(),
        &Coordinates::default(),
    );
    let result = ProducerWorker::new(id, publisher, count)
        .run(&shutdown)
        .await;

    session.close().await;
    result
}
