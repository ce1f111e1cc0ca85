// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the client.

/// Errors raised while rendering a message into the readable protocol.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} contains a protocol delimiter: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
}

/// Errors raised while fetching routing configuration from a collector.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unparseable router config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid router url {0}")]
    Url(String),

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Errors raised by configuration validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by background task control.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0} task panicked or was cancelled: {1}")]
    Join(&'static str, String),

    #[error("{0} task did not stop within the shutdown timeout")]
    ShutdownTimeout(&'static str),
}

/// Errors surfaced by the client entry points.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start router: {0}")]
    Router(#[from] RouterError),

    #[error(transparent)]
    Task(#[from] TaskError),
}
