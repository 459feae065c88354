// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ consumer sessions on top of lapin.
//!
//! A `server::Server` owns one supervised connection, declares its topology
//! and runs a group of consumers, restoring all of it after the broker or the
//! network drops the connection.

mod consumer;
mod otel;

#[cfg(test)]
mod fakes;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod group;
pub mod handler;
pub mod queue;
pub mod server;
pub mod topology;
pub mod transport;
