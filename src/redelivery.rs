// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redelivery Engine
//!
//! Turns a handler's [`Acknowledgement`] into the terminal broker action
//! for the inbound delivery: ack, reject, or requeue through a delay queue.
//! The engine holds no per-message state; every decision is a function of
//! the outcome, the retry settings, and the envelope carried in the
//! message's own headers.
//!
//! The core ordering guarantee lives here: when a retry copy is produced,
//! its publish is awaited through the confirmation tracker and only a
//! confirmed publish is followed by the ack of the original delivery. A
//! failed confirmation leaves the original un-acked so broker redelivery
//! takes over; the possible duplicate retry attempt is the documented
//! at-least-once tradeoff.

use crate::{
    channel::AmqpChannel,
    confirms::PublishConfirmationTracker,
    delay_queue::DelayedQueueProvisioner,
    envelope, otel, retry,
    errors::AmqpError,
    settings::{RetrySettings, SubscriberSettings},
};
use lapin::{message::Delivery, BasicProperties};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of handling one inbound message, produced exactly once per
/// delivery by the consuming pipeline.
#[derive(Debug)]
pub enum Acknowledgement {
    /// Processing succeeded; settle the message
    Ack,
    /// Processing failed; drop or requeue per the flag
    Nack { requeue: bool },
    /// Processing failed with a reason; drop or requeue per the flag
    Reject {
        reason: String,
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
        requeue: bool,
    },
}

impl Acknowledgement {
    pub fn reject(reason: &str, requeue: bool) -> Self {
        Acknowledgement::Reject {
            reason: reason.to_owned(),
            cause: None,
            requeue,
        }
    }

    pub fn reject_with_cause(
        reason: &str,
        cause: impl std::error::Error + Send + Sync + 'static,
        requeue: bool,
    ) -> Self {
        Acknowledgement::Reject {
            reason: reason.to_owned(),
            cause: Some(Box::new(cause)),
            requeue,
        }
    }
}

/// The slice of an inbound delivery the engine needs.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<&Delivery> for InboundMessage {
    fn from(delivery: &Delivery) -> Self {
        InboundMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            properties: delivery.properties.clone(),
            data: delivery.data.clone(),
        }
    }
}

/// Decides and performs the terminal action for each inbound delivery.
pub struct RedeliveryEngine<C: AmqpChannel> {
    channel: Arc<C>,
    tracker: Arc<PublishConfirmationTracker<C>>,
    provisioner: DelayedQueueProvisioner<C>,
    subscriber: SubscriberSettings,
    retry: RetrySettings,
}

impl<C: AmqpChannel + 'static> RedeliveryEngine<C> {
    pub fn new(
        channel: Arc<C>,
        tracker: Arc<PublishConfirmationTracker<C>>,
        subscriber: SubscriberSettings,
        retry: RetrySettings,
    ) -> Self {
        RedeliveryEngine {
            provisioner: DelayedQueueProvisioner::new(channel.clone()),
            channel,
            tracker,
            subscriber,
            retry,
        }
    }

    /// Performs the terminal action for `message` given the handler outcome.
    ///
    /// Invoked at most once per delivery tag. Confirmation and topology
    /// errors propagate to the caller with the original message left
    /// un-acked.
    pub async fn handle(
        &self,
        message: &InboundMessage,
        outcome: Acknowledgement,
    ) -> Result<(), AmqpError> {
        if self.subscriber.auto_ack {
            // The broker settled the message on delivery; nothing to do.
            debug!("auto-ack subscriber, no manual settlement");
            return Ok(());
        }

        match outcome {
            Acknowledgement::Ack => self.channel.ack(message.delivery_tag).await,

            Acknowledgement::Nack { requeue: false } => {
                self.channel.nack(message.delivery_tag, false).await
            }

            Acknowledgement::Reject {
                reason,
                cause,
                requeue: false,
            } => {
                warn!(
                    reason,
                    cause = cause.map(|c| c.to_string()).unwrap_or_default(),
                    "rejecting message without requeue"
                );
                self.channel.reject(message.delivery_tag, false).await
            }

            Acknowledgement::Nack { requeue: true } => self.requeue(message).await,

            Acknowledgement::Reject {
                reason,
                cause,
                requeue: true,
            } => {
                warn!(
                    reason,
                    cause = cause.map(|c| c.to_string()).unwrap_or_default(),
                    "message rejected, scheduling redelivery"
                );
                self.requeue(message).await
            }
        }
    }

    /// Publishes a retry copy and, once the broker confirmed it, acks the
    /// original delivery.
    async fn requeue(&self, message: &InboundMessage) -> Result<(), AmqpError> {
        let envelope = envelope::read(&message.properties);

        let exhausted = self
            .retry
            .max_attempts
            .is_some_and(|max| envelope.attempt >= max);
        if !self.retry.enabled || exhausted {
            warn!(
                attempt = envelope.attempt,
                enabled = self.retry.enabled,
                "retries unavailable, rejecting without requeue"
            );
            return self.channel.reject(message.delivery_tag, false).await;
        }

        let next_attempt = envelope.attempt + 1;
        let delay = retry::compute_delay(&self.retry, next_attempt);

        // Zero delay goes straight back to the tail of the origin queue;
        // otherwise through the delay queue, whose dead-letter routing
        // brings the message back once the TTL elapses. Both hops go
        // through the default exchange.
        let routing_key = if delay.is_zero() {
            self.subscriber.queue.clone()
        } else {
            self.provisioner.ensure(&self.subscriber.queue, delay).await?
        };

        let properties = envelope::stamp_retry(
            message.properties.clone(),
            next_attempt,
            &message.exchange,
            &message.routing_key,
        );
        let properties = otel::inject_current_context(properties);

        debug!(
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            routing_key,
            "publishing retry copy"
        );

        self.tracker
            .publish_confirmed("", &routing_key, properties, &message.data)
            .await?;

        // The retry copy is durable; only now is the original settled.
        self.channel.ack(message.delivery_tag).await
    }
}
