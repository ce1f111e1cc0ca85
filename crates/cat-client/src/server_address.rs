// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector endpoints and the `host:port;host:port` list syntax.

use std::fmt;
use tracing::warn;

/// Default port of the routing HTTP API on a collector.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// A collector endpoint.
///
/// Two addresses are equal when host and binary port match. The HTTP port is
/// metadata used to reach the routing API and does not identify a connection.
#[derive(Debug, Clone, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub http_port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16, http_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            http_port,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses a `host:port;host:port` list.
///
/// Malformed segments are logged and skipped, empty segments are ignored. The
/// HTTP port of every parsed address is set to `http_port`.
pub fn resolve_server_addresses(list: &str, http_port: u16) -> Vec<ServerAddress> {
    list.split(';')
        .filter(|segment| !segment.trim().is_empty())
        .filter_map(|segment| match parse_segment(segment.trim()) {
            Some((host, port)) => Some(ServerAddress::new(host, port, http_port)),
            None => {
                warn!("{segment} isn't a valid server address.");
                None
            }
        })
        .collect()
}

fn parse_segment(segment: &str) -> Option<(&str, u16)> {
    let mut fragments = segment.split(':');
    let host = fragments.next().filter(|host| !host.is_empty())?;
    let port = fragments.next()?.parse::<u16>().ok()?;
    if fragments.next().is_some() {
        return None;
    }
    Some((host, port))
}

/// Renders addresses back into the list syntax, used for log lines.
pub fn format_server_addresses(addresses: &[ServerAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}
