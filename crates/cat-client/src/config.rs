// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::hostinfo::{get_hostname, get_local_ip, ip_to_hex};
use crate::server_address::{resolve_server_addresses, ServerAddress, DEFAULT_HTTP_PORT};
use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_DOMAIN: &str = "cat";
pub const DEFAULT_ENV: &str = "dev";
pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_ROUTER_REFRESH_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What happens, besides dropping, when a message does not fit in a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Log a warning for every dropped message.
    Warn,
    /// Drop without logging.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub drop_policy: DropPolicy,
}

/// Configuration snapshot for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application identity reported in every frame header
    pub domain: String,
    /// Environment forwarded to the routing API
    pub env: String,
    /// Overrides hostname detection when set
    pub hostname: Option<String>,
    /// Overrides local ip detection when set
    pub ip: Option<Ipv4Addr>,
    /// Collectors whose routing API is polled for the router list
    pub servers: Vec<ServerAddress>,
    pub normal_queue: QueueConfig,
    pub high_queue: QueueConfig,
    pub router_refresh_interval: Duration,
    pub http_timeout: Duration,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Whether to report periodic system status heartbeats
    pub enable_monitor: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            env: DEFAULT_ENV.to_string(),
            hostname: None,
            ip: None,
            servers: Vec::new(),
            normal_queue: QueueConfig {
                capacity: DEFAULT_QUEUE_SIZE,
                drop_policy: DropPolicy::Silent,
            },
            high_queue: QueueConfig {
                capacity: DEFAULT_QUEUE_SIZE,
                drop_policy: DropPolicy::Warn,
            },
            router_refresh_interval: DEFAULT_ROUTER_REFRESH_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            enable_monitor: true,
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let domain = env::var("CAT_DOMAIN").unwrap_or(defaults.domain);
        let env_name = env::var("CAT_ENV").unwrap_or(defaults.env);
        let hostname = env::var("CAT_HOSTNAME").ok().filter(|h| !h.is_empty());
        let http_port = env::var("CAT_HTTP_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);
        let servers = env::var("CAT_SERVERS")
            .map(|list| resolve_server_addresses(&list, http_port))
            .unwrap_or_default();
        let normal_capacity = parse_env_or("CAT_NORMAL_QUEUE_SIZE", DEFAULT_QUEUE_SIZE);
        let high_capacity = parse_env_or("CAT_HIGH_QUEUE_SIZE", DEFAULT_QUEUE_SIZE);
        let router_refresh_interval = env::var("CAT_ROUTER_REFRESH_SECS")
            .ok()
            .and_then(|secs| secs.parse::<u64>().ok())
            .map_or(defaults.router_refresh_interval, Duration::from_secs);
        let enable_monitor = env::var("CAT_ENABLE_MONITOR")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);

        let config = Self {
            domain,
            env: env_name,
            hostname,
            servers,
            normal_queue: QueueConfig {
                capacity: normal_capacity,
                ..defaults.normal_queue
            },
            high_queue: QueueConfig {
                capacity: high_capacity,
                ..defaults.high_queue
            },
            router_refresh_interval,
            enable_monitor,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain cannot be empty".to_string()));
        }
        if self.domain.contains(['\t', '\n']) {
            return Err(ConfigError::Invalid(format!(
                "domain '{}' contains a tab or newline",
                self.domain
            )));
        }
        if self.normal_queue.capacity == 0 || self.high_queue.capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.router_refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "router refresh interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves hostname and ip, detecting whatever is not overridden.
    pub fn identity(&self) -> Identity {
        let ip = self.ip.unwrap_or_else(get_local_ip);
        Identity {
            domain: self.domain.clone(),
            env: self.env.clone(),
            hostname: self.hostname.clone().unwrap_or_else(get_hostname),
            ip: ip.to_string(),
            ip_hex: ip_to_hex(ip),
        }
    }
}

fn parse_env_or(var: &str, default: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Process-wide identity stamped on every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub domain: String,
    pub env: String,
    pub hostname: String,
    pub ip: String,
    pub ip_hex: String,
}
