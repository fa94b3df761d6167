// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Reliability Layer
//!
//! This module provides the error taxonomy for every operation the crate
//! performs: connecting, declaring delay queues, publishing with broker
//! confirmation, and acknowledging inbound deliveries. The confirmation
//! variants distinguish the four ways a tracked publish can fail so the
//! redelivery engine can report them without guessing.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Confirmation-related variants (`PublishNotConfirmed`, `PublishNacked`,
/// `PublishReturned`, `PublishChannelClosed`, `DuplicateSequenceTag`) are
/// produced by the publish-confirmation tracker; the remaining variants
/// cover connection, topology, and acknowledgement failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error performing the raw publish after the bounded retry budget
    #[error("failure to publish")]
    PublishingError,

    /// The broker did not confirm the publish within the configured window.
    /// The message may or may not have been enqueued broker-side.
    #[error("publish not confirmed within period")]
    PublishNotConfirmed,

    /// The broker explicitly refused the message
    #[error("publish not acknowledged by broker")]
    PublishNacked,

    /// The broker accepted the message but could not route it to any queue.
    /// Indicates a topology misconfiguration, e.g. a delay-queue binding.
    #[error("publish returned by broker: {code} {text}")]
    PublishReturned { code: u16, text: String },

    /// The channel was lost while the publish was outstanding
    #[error("channel closed: {0}")]
    PublishChannelClosed(String),

    /// A sequence tag was registered while a prior publish with the same tag
    /// was still pending. Always a bug.
    #[error("duplicate publish sequence tag `{0}`")]
    DuplicateSequenceTag(u64),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
