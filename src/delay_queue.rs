// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delay Queue Provisioning
//!
//! A delayed redelivery is implemented with a scratch queue whose message
//! TTL equals the computed delay and whose dead-letter configuration routes
//! expired messages back to the origin queue through the default exchange.
//! The queue also carries an `x-expires` argument so the broker drops it on
//! its own once it has been empty and unused past the delay; this subsystem
//! never deletes it explicitly.

use crate::{channel::AmqpChannel, errors::AmqpError};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Queue argument selecting the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument selecting the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument setting the per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument after which an unused queue is dropped by the broker
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// Safety margin added to the queue's own expiry beyond the message TTL
const QUEUE_EXPIRES_MARGIN: Duration = Duration::from_secs(10);

/// Deterministic name of the delay queue for a given origin queue and delay.
pub fn delayed_queue_name(queue: &str, delay: Duration) -> String {
    format!("{}-{}s-delayed-queue", queue, delay.as_secs())
}

/// Idempotently declares delay queues, one per (origin queue, delay) pair.
///
/// Declares are cached per instance so a pair is declared once per process;
/// the broker-side declare is idempotent regardless.
pub struct DelayedQueueProvisioner<C: AmqpChannel> {
    channel: Arc<C>,
    declared: Mutex<HashSet<String>>,
}

impl<C: AmqpChannel> DelayedQueueProvisioner<C> {
    pub fn new(channel: Arc<C>) -> Self {
        DelayedQueueProvisioner {
            channel,
            declared: Mutex::new(HashSet::default()),
        }
    }

    /// Ensures the delay queue for `(origin_queue, delay)` exists and
    /// returns its name.
    pub async fn ensure(&self, origin_queue: &str, delay: Duration) -> Result<String, AmqpError> {
        let name = delayed_queue_name(origin_queue, delay);

        {
            let declared = self.declared.lock().await;
            if declared.contains(&name) {
                return Ok(name);
            }
        }

        debug!("declaring delay queue: {}", name);

        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(origin_queue)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(delay.as_millis() as LongLongInt),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongLongInt((delay + QUEUE_EXPIRES_MARGIN).as_millis() as LongLongInt),
        );

        self.channel
            .declare_queue(&name, FieldTable::from(args))
            .await?;

        self.declared.lock().await.insert(name.clone());
        debug!("delay queue: {} was declared", name);

        Ok(name)
    }
}
