// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Harness Messages
//!
//! Producers send UTF-8 text bodies carrying their sequence number, marked
//! persistent, with a fixed pair of coordinate headers.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};

pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// AMQP delivery mode asking the broker to store the message on disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
pub const LATITUDE_HEADER: &str = "latitude";
pub const LONGITUDE_HEADER: &str = "longitude";

/// Latitude/longitude pair sent in every message's headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for Coordinates {
    fn default() -> Self {
        Coordinates {
            latitude: 51.5252949,
            longitude: -0.0905493,
        }
    }
}

impl Coordinates {
    pub fn to_field_table(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(LATITUDE_HEADER),
            AMQPValue::Double(self.latitude),
        );
        headers.insert(
            ShortString::from(LONGITUDE_HEADER),
            AMQPValue::Double(self.longitude),
        );
        headers
    }

    /// Reads both coordinates back, accepting single or double precision.
    pub fn from_field_table(headers: &FieldTable) -> Option<Coordinates> {
        let read = |key: &str| match headers.inner().get(key)? {
            AMQPValue::Double(value) => Some(*value),
            AMQPValue::Float(value) => Some(f64::from(*value)),
            _ => None,
        };

        Some(Coordinates {
            latitude: read(LATITUDE_HEADER)?,
            longitude: read(LONGITUDE_HEADER)?,
        })
    }
}

/// One message of a producer's sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub sequence: u64,
    pub body: String,
}

impl PublishMessage {
    pub fn sequenced(sequence: u64) -> Self {
        PublishMessage {
            sequence,
            body: format!("Hello, world! NUM {sequence}"),
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.body.as_bytes()
    }
}

/// Properties shared by every message a producer publishes.
///
/// Built once per producer and cloned for each publish.
pub fn properties_template(coordinates: &Coordinates) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(coordinates.to_field_table())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_embeds_sequence() {
        let msg = PublishMessage::sequenced(42);
        assert_eq!(msg.sequence, 42);
        assert_eq!(msg.body, "Hello, world! NUM 42");
        assert_eq!(msg.payload(), b"Hello, world! NUM 42");
    }

    #[test]
    fn test_properties_template() {
        let props = properties_template(&Coordinates::default());

        assert_eq!(
            props.content_type().as_ref().map(|v| v.as_str()),
            Some(TEXT_CONTENT_TYPE)
        );
        assert_eq!(*props.delivery_mode(), Some(2));

        let headers = props.headers().as_ref().unwrap();
        assert_eq!(headers.inner().len(), 2);
        assert_eq!(
            Coordinates::from_field_table(headers),
            Some(Coordinates {
                latitude: 51.5252949,
                longitude: -0.0905493,
            })
        );
    }

    #[test]
    fn test_properties_template_sets_nothing_else() {
        let props = properties_template(&Coordinates::default());

        assert!(props.message_id().is_none());
        assert!(props.correlation_id().is_none());
        assert!(props.timestamp().is_none());
        assert!(props.priority().is_none());
        assert!(props.expiration().is_none());
    }

    #[test]
    fn test_coordinates_need_both_headers() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(LATITUDE_HEADER),
            AMQPValue::Double(1.0),
        );
        assert_eq!(Coordinates::from_field_table(&headers), None);

        headers.insert(
            ShortString::from(LONGITUDE_HEADER),
            AMQPValue::LongString("east".into()),
        );
        assert_eq!(Coordinates::from_field_table(&headers), None);
    }
}
