// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! The `Publisher` trait is the seam between the producer loop and the broker.
//! `RabbitMQPublisher` sends to a fixed exchange and routing key and does not wait
//! for publisher confirms: a publish only fails when the channel rejects it.

use crate::{
    errors::AmqpError,
    message::{properties_template, Coordinates, PublishMessage},
};
use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties, Channel};
use tracing::error;

/// Sends one message to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    channel: Channel,
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
}

impl RabbitMQPublisher {
    /// Creates a publisher bound to `exchange` and `routing_key`.
    ///
    /// # Parameters
    /// * `channel` - The producer's own channel
    /// * `coordinates` - Header values attached to every message
    pub fn new(
        channel: Channel,
        exchange: &str,
        routing_key: &str,
        coordinates: &Coordinates,
    ) -> RabbitMQPublisher {
        RabbitMQPublisher {
            channel,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties_template(coordinates),
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                msg.payload(),
                self.properties.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    sequence = msg.sequence,
                    "error publishing message"
                );
                Err(AmqpError::PublishingError(msg.sequence))
            }
            // The returned confirm is dropped: no publisher-confirm wait.
            _ => Ok(()),
        }
    }
}
