// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Capability
//!
//! This module defines the minimal channel surface the reliability layer
//! needs (publish, queue declare, ack/nack/reject) as a trait, plus the
//! lapin-backed implementation and the connection bootstrap. Keeping the
//! surface small lets the confirmation tracker and the redelivery engine be
//! exercised against a mock channel in tests.
//!
//! The lapin implementation puts the channel in confirm-select mode and
//! forwards every confirmation outcome (ack, nack, returned message,
//! channel loss) as a typed [`ConfirmationEvent`] for the tracker to
//! consume. Returned messages carry no sequence number on the wire; the
//! sequence stamped into the message headers before publishing is used to
//! correlate them.

use crate::{
    confirms::ConfirmationEvent,
    envelope,
    errors::AmqpError,
    settings::ConnectionSettings,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

/// Minimal channel capability used by the reliability layer.
///
/// `publish` resolves once the frame has been handed to the broker; the
/// broker's confirmation arrives later as a [`ConfirmationEvent`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    /// Idempotently declares a durable queue with the given arguments.
    async fn declare_queue(&self, name: &str, args: FieldTable) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// lapin-backed [`AmqpChannel`] in confirm-select mode.
pub struct LapinChannel {
    channel: Arc<Channel>,
    events: UnboundedSender<ConfirmationEvent>,
}

impl LapinChannel {
    /// Wraps a raw lapin channel, enabling publisher confirms on it.
    ///
    /// Confirmation outcomes for every publish made through this wrapper
    /// are forwarded to `events`.
    pub async fn new(
        channel: Arc<Channel>,
        events: UnboundedSender<ConfirmationEvent>,
    ) -> Result<Self, AmqpError> {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        Ok(LapinChannel { channel, events })
    }

    /// The underlying lapin channel, for consume-side operations.
    pub fn raw(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    fn forward_confirmation(
        events: &UnboundedSender<ConfirmationEvent>,
        tag: Option<u64>,
        confirmation: Confirmation,
    ) {
        let event = match confirmation {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                // A returned message means "accepted but unroutable"; the
                // sequence stamped into its headers correlates it.
                let stamped = envelope::publish_sequence(&returned.delivery.properties).or(tag);
                Some(ConfirmationEvent::Return {
                    tag: stamped,
                    code: returned.reply_code,
                    text: returned.reply_text.to_string(),
                })
            }
            Confirmation::Ack(None) => tag.map(|tag| ConfirmationEvent::Ack {
                tag,
                multiple: false,
            }),
            Confirmation::Nack(None) => tag.map(|tag| ConfirmationEvent::Nack {
                tag,
                multiple: false,
            }),
            Confirmation::NotRequested => {
                // Confirm-select was not active on the channel, so this is
                // not a durable broker confirm. Settle the publish anyway,
                // but loudly: the channel is misconfigured.
                warn!("broker confirmation was not requested, settling publish unconfirmed");
                tag.map(|tag| ConfirmationEvent::Ack {
                    tag,
                    multiple: false,
                })
            }
        };

        match event {
            Some(event) => {
                let _ = events.send(event);
            }
            None => warn!("confirmation for an unstamped publish, cannot correlate"),
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let tag = envelope::publish_sequence(&properties);

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(confirmation) => Self::forward_confirmation(&events, tag, confirmation),
                Err(err) => {
                    let _ = events.send(ConfirmationEvent::ChannelClosed {
                        reason: err.to_string(),
                    });
                }
            }
        });

        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: FieldTable) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was declared", name);
                Ok(())
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

/// Creates a connection and a confirm-enabled channel on it.
///
/// Connection-level errors are forwarded to `events` as
/// [`ConfirmationEvent::ChannelClosed`] so no pending publish awaiter hangs
/// across a connection loss.
pub async fn new_amqp_channel(
    cfg: &ConnectionSettings,
    events: UnboundedSender<ConfirmationEvent>,
) -> Result<(Arc<Connection>, Arc<LapinChannel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    let error_events = events.clone();
    conn.on_error(move |err| {
        let _ = error_events.send(ConfirmationEvent::ChannelClosed {
            reason: err.to_string(),
        });
    });

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }?;
    debug!("channel created");

    let wrapped = LapinChannel::new(Arc::new(channel), events).await?;

    Ok((Arc::new(conn), Arc::new(wrapped)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn forwarded(tag: Option<u64>, confirmation: Confirmation) -> Option<ConfirmationEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        LapinChannel::forward_confirmation(&tx, tag, confirmation);
        rx.try_recv().ok()
    }

    #[test]
    fn broker_ack_maps_to_an_ack_event() {
        assert_eq!(
            forwarded(Some(3), Confirmation::Ack(None)),
            Some(ConfirmationEvent::Ack {
                tag: 3,
                multiple: false
            })
        );
    }

    #[test]
    fn broker_nack_maps_to_a_nack_event() {
        assert_eq!(
            forwarded(Some(3), Confirmation::Nack(None)),
            Some(ConfirmationEvent::Nack {
                tag: 3,
                multiple: false
            })
        );
    }

    #[test]
    fn unrequested_confirmation_still_settles_the_tag() {
        // Misconfigured channel (confirm-select inactive): the publish is
        // settled rather than left to hang on a confirm that cannot come.
        assert_eq!(
            forwarded(Some(3), Confirmation::NotRequested),
            Some(ConfirmationEvent::Ack {
                tag: 3,
                multiple: false
            })
        );
    }

    #[test]
    fn unstamped_confirmation_is_dropped() {
        assert_eq!(forwarded(None, Confirmation::Ack(None)), None);
    }
}
