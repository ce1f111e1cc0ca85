// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # CAT client
//!
//! Records transactions, events, heartbeats and metrics and streams them to a
//! CAT collector over TCP using the readable `PT1` text protocol.
//!
//! ## Architecture
//!
//! - [`message`]: the message model and the transaction tree
//! - [`encoder`]: line encoding and frame length prefix
//! - [`sender`]: priority queues and the connection writer task
//! - [`router`]: routing API poller that picks the collector to connect to
//! - [`monitor`]: periodic host status heartbeats
//! - [`client`]: [`CatClient`], which wires the tasks together
//!
//! Completed root messages are handed to a non-blocking flush callback; the
//! caller never waits on the network.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod hostinfo;
pub mod message;
pub mod monitor;
pub mod router;
pub mod sender;
pub mod server_address;
pub mod task;

pub use client::CatClient;
pub use config::{ClientConfig, DropPolicy, Identity, QueueConfig};
pub use errors::{ClientError, ConfigError, EncodeError, RouterError, TaskError};
pub use message::{
    CorrelationContext, Event, Flush, Heartbeat, Message, MessageFields, Metric, Transaction,
    SUCCESS,
};
pub use monitor::{OsInfo, StatusCollector};
pub use server_address::ServerAddress;
