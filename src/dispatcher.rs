// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Worker
//!
//! A consumer subscribes to the work queue with manual acknowledgment and handles
//! deliveries one at a time, in the order the broker sends them on its channel.
//! Several consumers on the same queue compete for messages; dispatch between them
//! is left to the broker.
//!
//! The subscription lives until the shutdown signal flips, the broker cancels the
//! consumer, or a settlement cannot be sent.

use crate::{
    channel::open_session,
    connection::{BrokerEndpoint, ConnectionBuilder, Connector},
    consumer::{consume, ConsumerHandler, InboundDelivery, Settlement},
    errors::AmqpError,
    topology::TopologyPlan,
};
use futures_util::{Stream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel, Connection};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Lifecycle of a consumer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribed,
    Receiving,
}

/// Consumes one queue on one channel.
pub struct RabbitMQDispatcher {
    channel: Channel,
    consumer_tag: String,
    deliveries: DeliveryLoop,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `id` - Worker number, used in logs and in the consumer tag
    /// * `channel` - The worker's own channel
    /// * `queue` - Queue to consume from
    /// * `handler` - Processing applied to each message before the ack
    pub fn new(
        id: usize,
        channel: Channel,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        RabbitMQDispatcher {
            channel,
            consumer_tag: format!("harness-consumer-{id}-{}", Uuid::new_v4()),
            deliveries: DeliveryLoop::new(id, queue, handler),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.deliveries.state()
    }

    /// Subscribes and handles deliveries until `shutdown` reads `true`.
    ///
    /// Returns the number of acknowledged messages. The subscription is
    /// registered before the first delivery is read, so no message can reach
    /// the handler before `basic_consume` has completed.
    pub async fn consume_until(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<u64, AmqpError> {
        let queue = self.deliveries.queue.clone();
        let consumer = match self
            .channel
            .basic_consume(
                &queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            consumer = self.deliveries.id,
            queue = queue.as_str(),
            tag = self.consumer_tag.as_str(),
            "consumer subscribed"
        );

        self.deliveries.run(consumer, shutdown).await
    }
}

/// Handles the deliveries of one subscription, one at a time.
pub struct DeliveryLoop {
    id: usize,
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    state: ConsumerState,
}

impl DeliveryLoop {
    pub fn new(id: usize, queue: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        DeliveryLoop {
            id,
            queue: queue.to_owned(),
            handler,
            state: ConsumerState::Idle,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Settles every delivery of `deliveries` until `shutdown` reads `true` or
    /// the stream ends.
    ///
    /// Returns the number of acknowledged messages. A failed ack or nack, or an
    /// error item on the stream, ends the loop with that error.
    pub async fn run<S, D>(
        &mut self,
        deliveries: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, AmqpError>
    where
        S: Stream<Item = Result<D, lapin::Error>>,
        D: InboundDelivery,
    {
        tokio::pin!(deliveries);
        self.state = ConsumerState::Subscribed;

        let mut acked = 0;
        let mut requeued = 0;

        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(consumer = self.id, "shutdown sender dropped");
                        break;
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.state = ConsumerState::Receiving;
                        match consume(&self.queue, &delivery, self.handler.as_ref()).await? {
                            Settlement::Acked => acked += 1,
                            Settlement::Requeued => requeued += 1,
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return Err(AmqpError::ConsumerError(err.to_string()));
                    }
                    None => {
                        info!(consumer = self.id, "consumer cancelled by the broker");
                        break;
                    }
                },
            }
        }

        info!(
            consumer = self.id,
            acked,
            requeued,
            state = ?self.state,
            "consumer stopped"
        );
        Ok(acked)
    }
}

/// Opens a session, runs one consumer on it and closes the session afterwards.
pub async fn run_consumer<C>(
    id: usize,
    builder: &ConnectionBuilder<C>,
    endpoint: &BrokerEndpoint,
    plan: &TopologyPlan,
    handler: Arc<dyn ConsumerHandler>,
    shutdown: watch::Receiver<bool>,
) -> Result<u64, AmqpError>
where
    C: Connector<Connection = Connection>,
{
    let session = open_session(builder, endpoint).await?;

    let mut dispatcher =
        RabbitMQDispatcher::new(id, session.channel().clone(), plan.queue_name(), handler);
    let result = dispatcher.consume_until(shutdown).await;
    debug!(consumer = id, state = ?dispatcher.state(), "consumer released");

    session.close().await;
    result
}
