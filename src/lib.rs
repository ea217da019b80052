// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod message;
pub mod orchestrator;
pub mod producer;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use consumer::{
    ConsumerHandler, ConsumerMessage, InboundDelivery, ProgressHandler, Settlement,
};
