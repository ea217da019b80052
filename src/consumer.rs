// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery: the message is handed to a
//! [`ConsumerHandler`] and then settled on the channel it arrived on. Successful
//! processing is acknowledged for that delivery tag alone; a handler failure
//! returns the message to the queue.

use crate::{errors::AmqpError, message::Coordinates};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::FieldTable,
};
use std::{io::Write, sync::Mutex};
use tracing::{debug, error, warn};

/// A received message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub coordinates: Option<Coordinates>,
}

impl ConsumerMessage {
    pub fn new(
        queue: &str,
        delivery_tag: u64,
        redelivered: bool,
        data: &[u8],
        headers: Option<&FieldTable>,
    ) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            delivery_tag,
            redelivered,
            data: data.to_vec(),
            coordinates: headers.and_then(Coordinates::from_field_table),
        }
    }

    pub fn from_delivery(queue: &str, delivery: &Delivery) -> Self {
        ConsumerMessage::new(
            queue,
            delivery.delivery_tag,
            delivery.redelivered,
            &delivery.data,
            delivery.properties.headers().as_ref(),
        )
    }

    pub fn body(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Processes one received message before it is acknowledged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Writes one `.` per processed message to the wrapped writer.
pub struct ProgressHandler<W> {
    out: Mutex<W>,
}

impl<W> ProgressHandler<W>
where
    W: Write + Send,
{
    pub fn new(out: W) -> Self {
        ProgressHandler {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W> ConsumerHandler for ProgressHandler<W>
where
    W: Write + Send,
{
    async fn exec(&self, _msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| AmqpError::InternalError("progress writer poisoned".to_owned()))?;

        out.write_all(b".")
            .and_then(|_| out.flush())
            .map_err(|err| AmqpError::HandlerError(err.to_string()))
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
}

/// A delivery that can be read and settled on the channel it arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboundDelivery: Send + Sync {
    fn message(&self, queue: &str) -> ConsumerMessage;

    async fn ack(&self, options: BasicAckOptions) -> lapin::Result<()>;

    async fn nack(&self, options: BasicNackOptions) -> lapin::Result<()>;
}

#[async_trait]
impl InboundDelivery for Delivery {
    fn message(&self, queue: &str) -> ConsumerMessage {
        ConsumerMessage::from_delivery(queue, self)
    }

    async fn ack(&self, options: BasicAckOptions) -> lapin::Result<()> {
        self.acker.ack(options).await
    }

    async fn nack(&self, options: BasicNackOptions) -> lapin::Result<()> {
        self.acker.nack(options).await
    }
}

/// Runs `handler` on `delivery` and settles it.
///
/// # Errors
/// * [`AmqpError::AckMessageError`] / [`AmqpError::NackMessageError`] when the
///   settlement cannot be sent; these end the consumer.
pub(crate) async fn consume<D>(
    queue: &str,
    delivery: &D,
    handler: &dyn ConsumerHandler,
) -> Result<Settlement, AmqpError>
where
    D: InboundDelivery + ?Sized,
{
    let msg = delivery.message(queue);

    debug!(
        delivery_tag = msg.delivery_tag,
        redelivered = msg.redelivered,
        "received: {} - queue: {}",
        msg.body().unwrap_or("<binary>"),
        queue,
    );

    if let Err(err) = handler.exec(&msg).await {
        warn!(
            error = err.to_string(),
            delivery_tag = msg.delivery_tag,
            "error whiling handling msg, requeuing for latter"
        );

        return match delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
        {
            Ok(_) => Ok(Settlement::Requeued),
            Err(e) => {
                error!(error = e.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError(msg.delivery_tag))
            }
        };
    }

    match delivery.ack(BasicAckOptions { multiple: false }).await {
        Ok(_) => Ok(Settlement::Acked),
        Err(e) => {
            error!(error = e.to_string(), "error whiling ack msg");
            Err(AmqpError::AckMessageError(msg.delivery_tag))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{LATITUDE_HEADER, LONGITUDE_HEADER};
    use lapin::types::{AMQPValue, ShortString};

    fn delivery(tag: u64) -> MockInboundDelivery {
        let mut delivery = MockInboundDelivery::new();
        delivery
            .expect_message()
            .returning(move |queue| ConsumerMessage::new(queue, tag, false, b"x", None));
        delivery
    }

    fn failing_handler() -> MockConsumerHandler {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_| Err(AmqpError::HandlerError("boom".to_owned())));
        handler
    }

    #[test]
    fn test_message_exposes_coordinates_and_body() {
        let headers = Coordinates::default().to_field_table();

        let msg = ConsumerMessage::new(
            "queue1_work",
            7,
            false,
            b"Hello, world! NUM 7",
            Some(&headers),
        );

        assert_eq!(msg.delivery_tag, 7);
        assert_eq!(msg.body(), Some("Hello, world! NUM 7"));
        assert_eq!(msg.coordinates, Some(Coordinates::default()));
    }

    #[test]
    fn test_message_without_headers() {
        let msg = ConsumerMessage::new("queue1_work", 1, true, &[0xff, 0xfe], None);

        assert!(msg.redelivered);
        assert_eq!(msg.body(), None);
        assert_eq!(msg.coordinates, None);
    }

    #[test]
    fn test_float_headers_are_accepted() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(LATITUDE_HEADER), AMQPValue::Float(1.5));
        headers.insert(ShortString::from(LONGITUDE_HEADER), AMQPValue::Double(-2.25));

        let msg = ConsumerMessage::new("q", 1, false, b"", Some(&headers));

        assert_eq!(
            msg.coordinates,
            Some(Coordinates {
                latitude: 1.5,
                longitude: -2.25,
            })
        );
    }

    #[tokio::test]
    async fn test_progress_handler_writes_one_dot_per_message() {
        let handler = ProgressHandler::new(Vec::new());
        let msg = ConsumerMessage::new("queue1_work", 1, false, b"x", None);

        for _ in 0..3 {
            handler.exec(&msg).await.unwrap();
        }

        assert_eq!(handler.into_inner(), b"...".to_vec());
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked_once() {
        let mut delivery = delivery(3);
        delivery
            .expect_ack()
            .withf(|opts| !opts.multiple)
            .times(1)
            .returning(|_| Ok(()));
        delivery.expect_nack().never();

        let handler = ProgressHandler::new(Vec::new());
        let settled = consume("queue1_work", &delivery, &handler).await;

        assert_eq!(settled, Ok(Settlement::Acked));
        assert_eq!(handler.into_inner(), b".".to_vec());
    }

    #[tokio::test]
    async fn test_handler_failure_requeues_once() {
        let mut delivery = delivery(4);
        delivery.expect_ack().never();
        delivery
            .expect_nack()
            .withf(|opts| opts.requeue && !opts.multiple)
            .times(1)
            .returning(|_| Ok(()));

        let settled = consume("queue1_work", &delivery, &failing_handler()).await;

        assert_eq!(settled, Ok(Settlement::Requeued));
    }

    #[tokio::test]
    async fn test_failed_ack_is_reported_with_its_tag() {
        let mut delivery = delivery(5);
        delivery
            .expect_ack()
            .times(1)
            .returning(|_| Err(lapin::Error::ChannelsLimitReached));

        let handler = ProgressHandler::new(Vec::new());
        let settled = consume("queue1_work", &delivery, &handler).await;

        assert_eq!(settled, Err(AmqpError::AckMessageError(5)));
    }

    #[tokio::test]
    async fn test_failed_nack_is_reported_with_its_tag() {
        let mut delivery = delivery(6);
        delivery.expect_ack().never();
        delivery
            .expect_nack()
            .times(1)
            .returning(|_| Err(lapin::Error::ChannelsLimitReached));

        let settled = consume("queue1_work", &delivery, &failing_handler()).await;

        assert_eq!(settled, Err(AmqpError::NackMessageError(6)));
    }
}
