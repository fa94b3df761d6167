// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Associates queues with handlers and runs the consume loops. A handler
//! returns an [`Acknowledgement`] for each delivery; the terminal broker
//! action (ack, reject, delayed requeue) is decided by the
//! [`RedeliveryEngine`], never by the handler itself.

use crate::{
    channel::LapinChannel,
    confirms::PublishConfirmationTracker,
    consumer::consume,
    errors::AmqpError,
    redelivery::{Acknowledgement, InboundMessage, RedeliveryEngine},
    settings::{RetrySettings, SubscriberSettings},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::{global, Context};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Processes one inbound message and reports how it should be settled.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, message: &InboundMessage) -> Acknowledgement;
}

/// A queue subscription: settings plus the handler that processes its
/// messages.
#[derive(Clone)]
pub struct SubscriberDefinition {
    pub(crate) settings: SubscriberSettings,
    pub(crate) retry: RetrySettings,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Consumes registered queues and routes each delivery through its handler
/// and the redelivery engine.
pub struct AmqpDispatcher {
    channel: Arc<LapinChannel>,
    tracker: Arc<PublishConfirmationTracker<LapinChannel>>,
    subscribers: Vec<SubscriberDefinition>,
}

impl AmqpDispatcher {
    pub fn new(
        channel: Arc<LapinChannel>,
        tracker: Arc<PublishConfirmationTracker<LapinChannel>>,
    ) -> Self {
        AmqpDispatcher {
            channel,
            tracker,
            subscribers: vec![],
        }
    }

    /// Registers a handler for a queue.
    pub fn register(
        mut self,
        settings: SubscriberSettings,
        retry: RetrySettings,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.subscribers.push(SubscriberDefinition {
            settings,
            retry,
            handler,
        });
        self
    }

    /// Starts one consumer per registered queue and blocks until they end.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut spawns = vec![];

        for def in &self.subscribers {
            let raw = self.channel.raw();

            if let Err(err) = raw
                .basic_qos(def.settings.prefetch_count, BasicQosOptions::default())
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(def.settings.queue.clone()));
            }

            let consumer_tag = format!("{}-{}", def.settings.queue, Uuid::new_v4());
            let mut consumer = match raw
                .basic_consume(
                    &def.settings.queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: def.settings.auto_ack,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError)
                }
                Ok(c) => Ok(c),
            }?;

            let def = def.clone();
            let engine = RedeliveryEngine::new(
                self.channel.clone(),
                self.tracker.clone(),
                def.settings.clone(),
                def.retry.clone(),
            );

            spawns.push(tokio::spawn(async move {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = consume(
                                &global::tracer("amqp consumer"),
                                &delivery,
                                def.handler.clone(),
                                &engine,
                            )
                            .await
                            {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }
            }));
        }

        let spawned = join_all(spawns).await;
        for res in spawned {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}
