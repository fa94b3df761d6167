// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Delivery Consumption
//!
//! Runs the handler for one delivery inside a consumer span and hands the
//! resulting acknowledgement to the redelivery engine. Engine failures
//! (unconfirmed retry publish, topology errors) surface to the dispatch
//! loop; the original delivery is left for the broker to redeliver.

use crate::{
    channel::LapinChannel,
    dispatcher::ConsumerHandler,
    errors::AmqpError,
    otel,
    redelivery::{InboundMessage, RedeliveryEngine},
};
use lapin::message::Delivery;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::debug;

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: Arc<dyn ConsumerHandler>,
    engine: &RedeliveryEngine<LapinChannel>,
) -> Result<(), AmqpError> {
    let message = InboundMessage::from(delivery);

    let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, &message.routing_key);

    debug!(
        "received from exchange: {} with key: {}",
        message.exchange, message.routing_key,
    );

    let outcome = handler.exec(&ctx, &message).await;

    match engine.handle(&message, outcome).await {
        Ok(()) => {
            span.set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error settling msg"),
            });
            Err(err)
        }
    }
}
