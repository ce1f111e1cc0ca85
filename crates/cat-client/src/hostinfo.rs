// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname and local address detection.

use std::env;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::warn;

pub const DEFAULT_HOSTNAME: &str = "unknown";
pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

// Connecting a UDP socket sends nothing; it only selects the outbound interface.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Get the system hostname
///
/// Order: `HOSTNAME`, `gethostname()`, then `"unknown"`. The `CAT_HOSTNAME`
/// override is applied by [`crate::config::ClientConfig::from_env`].
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                return hostname.to_string();
            }
        }
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    warn!("Could not determine hostname, using '{DEFAULT_HOSTNAME}'");
    DEFAULT_HOSTNAME.to_string()
}

/// Returns the IPv4 address of the interface used for outbound traffic.
#[must_use]
pub fn get_local_ip() -> Ipv4Addr {
    let probe = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect(ROUTE_PROBE_ADDR)?;
        socket.local_addr()
    });

    match probe.map(|addr| addr.ip()) {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        Ok(ip) => {
            warn!("Local address {ip} is not usable, using default ip: {DEFAULT_IP}");
            DEFAULT_IP
        }
        Err(e) => {
            warn!("Error while getting local ip, using default ip: {DEFAULT_IP}: {e}");
            DEFAULT_IP
        }
    }
}

/// Lower-case hex rendering of the four octets, used inside message ids.
#[must_use]
pub fn ip_to_hex(ip: Ipv4Addr) -> String {
    ip.octets().iter().map(|octet| format!("{octet:02x}")).collect()
}
