// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Envelope Codec
//!
//! Reads and writes the retry bookkeeping carried in message headers: the
//! attempt counter, the original exchange/routing-key the message first
//! arrived with, and the publish sequence marker used to correlate broker
//! `basic.return` events (which carry no sequence number of their own).
//!
//! The original exchange and routing key are captured exactly once, on the
//! first retry, and propagated unchanged on every later hop. Recomputing
//! them from a delay-queue's own delivery context would lose the routing
//! provenance after two or more retries.

use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Header carrying the attempt counter; a message without it is attempt 1
pub const AMQP_HEADERS_RETRY_ATTEMPT: &str = "x-retry-attempt";
/// Header carrying the exchange the message originally arrived through
pub const AMQP_HEADERS_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header carrying the routing key the message originally arrived with
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Header carrying the publish sequence tag, stamped so a later
/// `basic.return` can be correlated back to its pending publish
pub const AMQP_HEADERS_PUBLISH_SEQUENCE: &str = "x-publish-sequence";

/// Retry bookkeeping decoded from a delivery's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    pub attempt: u32,
    pub original_exchange: Option<String>,
    pub original_routing_key: Option<String>,
}

/// Decodes the retry envelope from message properties.
///
/// A missing or malformed attempt header is read as attempt 1 (first
/// processing attempt).
pub fn read(props: &BasicProperties) -> RetryEnvelope {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let attempt = match headers.inner().get(AMQP_HEADERS_RETRY_ATTEMPT) {
        Some(value) => value
            .as_long_long_int()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1),
        None => 1,
    };

    RetryEnvelope {
        attempt: attempt.max(1),
        original_exchange: header_string(&headers, AMQP_HEADERS_ORIGINAL_EXCHANGE),
        original_routing_key: header_string(&headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
    }
}

/// Stamps the envelope for a retry republish.
///
/// Writes the given attempt number and, only when not already present,
/// captures `current_exchange`/`current_routing_key` as the original
/// routing identity. Existing original-* headers are never overwritten.
pub fn stamp_retry(
    props: BasicProperties,
    attempt: u32,
    current_exchange: &str,
    current_routing_key: &str,
) -> BasicProperties {
    let mut headers = inner_headers(&props);

    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_ATTEMPT),
        AMQPValue::LongLongInt(LongLongInt::from(attempt)),
    );

    headers
        .entry(ShortString::from(AMQP_HEADERS_ORIGINAL_EXCHANGE))
        .or_insert_with(|| AMQPValue::LongString(LongString::from(current_exchange)));
    headers
        .entry(ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY))
        .or_insert_with(|| AMQPValue::LongString(LongString::from(current_routing_key)));

    props.with_headers(FieldTable::from(headers))
}

/// Stamps the publish sequence tag onto the outgoing properties.
pub fn stamp_publish_sequence(props: BasicProperties, tag: u64) -> BasicProperties {
    let mut headers = inner_headers(&props);

    headers.insert(
        ShortString::from(AMQP_HEADERS_PUBLISH_SEQUENCE),
        AMQPValue::LongLongInt(tag as LongLongInt),
    );

    props.with_headers(FieldTable::from(headers))
}

/// Recovers the stamped publish sequence tag, if any.
pub fn publish_sequence(props: &BasicProperties) -> Option<u64> {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_PUBLISH_SEQUENCE).cloned())
        .and_then(|value| value.as_long_long_int())
        .and_then(|v| u64::try_from(v).ok())
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    headers.inner().get(key).and_then(|value| match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).to_string()),
        _ => None,
    })
}

fn inner_headers(props: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    match props.headers() {
        Some(val) => val.inner().clone(),
        None => BTreeMap::default(),
    }
}
