// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod channel;
pub mod confirms;
pub mod delay_queue;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod redelivery;
pub mod retry;
pub mod settings;
