// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Router task: polls the routing API and keeps the Sender connected.

use crate::config::{ClientConfig, Identity};
use crate::errors::RouterError;
use crate::sender::Connection;
use crate::server_address::{
    format_server_addresses, resolve_server_addresses, ServerAddress, DEFAULT_HTTP_PORT,
};
use crate::task::{default_handle_signal, Control, Signal, SignalInbox, Task};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_SAMPLE: f64 = 1.0;

const ROUTER_PATH: &str = "/cat/s/router";
const PROPERTY_SAMPLE: &str = "sample";
const PROPERTY_ROUTERS: &str = "routers";
const PROPERTY_BLOCK: &str = "block";
const SAMPLE_EPSILON: f64 = 1e-9;

/// Whether completed messages are forwarded to the Sender.
#[derive(Debug, Clone)]
pub struct TrafficSwitch {
    enabled: Arc<AtomicBool>,
}

impl Default for TrafficSwitch {
    fn default() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl TrafficSwitch {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Returns the previous state.
    pub(crate) fn set(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }
}

#[derive(Debug, Deserialize)]
struct RouterConfigResponse {
    #[serde(default)]
    kvs: HashMap<String, String>,
}

pub struct Router {
    identity: Arc<Identity>,
    servers: Vec<ServerAddress>,
    http: reqwest::Client,
    sample: f64,
    sample_tx: watch::Sender<f64>,
    routers: Vec<ServerAddress>,
    current: Option<ServerAddress>,
    refresh_interval: Duration,
    ticker: Option<Interval>,
    dial_timeout: Duration,
    connections: mpsc::Sender<Connection>,
    switch: TrafficSwitch,
}

impl Router {
    pub fn new(
        config: &ClientConfig,
        identity: Arc<Identity>,
        connections: mpsc::Sender<Connection>,
        switch: TrafficSwitch,
    ) -> Result<(Self, watch::Receiver<f64>), RouterError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(RouterError::Client)?;
        let (sample_tx, sample_rx) = watch::channel(DEFAULT_SAMPLE);

        let router = Router {
            identity,
            servers: config.servers.clone(),
            http,
            sample: DEFAULT_SAMPLE,
            sample_tx,
            routers: Vec::new(),
            current: None,
            refresh_interval: config.router_refresh_interval,
            ticker: None,
            dial_timeout: config.dial_timeout,
            connections,
            switch,
        };
        Ok((router, sample_rx))
    }

    fn router_url(&self, server: &ServerAddress) -> Result<Url, RouterError> {
        let raw = format!("http://{}:{}{ROUTER_PATH}", server.host, server.http_port);
        let mut url = Url::parse(&raw).map_err(|e| RouterError::Url(format!("{raw}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("env", &self.identity.env)
            .append_pair("domain", &self.identity.domain)
            .append_pair("ip", &self.identity.ip)
            .append_pair("hostname", &self.identity.hostname)
            .append_pair("op", "json");
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> Result<RouterConfigResponse, RouterError> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Asks each registered server in turn until one answers with a usable config.
    pub async fn update_router_config(&mut self) {
        for server in self.servers.clone() {
            let url = match self.router_url(&server) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Skipping server {server}: {e}");
                    continue;
                }
            };
            info!("Getting router config from {url}");

            match self.fetch(url.clone()).await {
                Ok(config) => {
                    self.apply_router_config(&config.kvs).await;
                    return;
                }
                Err(RouterError::Decode(e)) => {
                    warn!("Error occurred while parsing router config json content from {url}: {e}");
                }
                Err(e) => {
                    warn!("Error occurred while getting router config from url {url}: {e}");
                }
            }
        }

        error!("Can't get router config from remote server.");
    }

    async fn apply_router_config(&mut self, kvs: &HashMap<String, String>) {
        if let Some(sample) = kvs.get(PROPERTY_SAMPLE) {
            self.update_sample(sample);
        }
        if let Some(block) = kvs.get(PROPERTY_BLOCK) {
            self.update_block(block);
        }
        if let Some(routers) = kvs.get(PROPERTY_ROUTERS) {
            self.update_routers(routers).await;
        }
    }

    /// Returns true when the published sample rate changed.
    fn update_sample(&mut self, value: &str) -> bool {
        let sample = match value.trim().parse::<f64>() {
            Ok(sample) if (0.0..=1.0).contains(&sample) => sample,
            _ => {
                warn!("Sample should be a valid float, {value} given");
                return false;
            }
        };

        if (sample - self.sample).abs() <= SAMPLE_EPSILON {
            return false;
        }
        self.sample = sample;
        self.sample_tx.send_replace(sample);
        info!("Sample rate has been set to {:.2}%", sample * 100.0);
        true
    }

    fn update_block(&mut self, value: &str) {
        let enabled = value == "false";
        if self.switch.set(enabled) != enabled {
            if enabled {
                info!("Traffic has been enabled by router config.");
            } else {
                warn!("Traffic has been blocked by router config.");
            }
        }
    }

    async fn update_routers(&mut self, value: &str) {
        let routers = resolve_server_addresses(value, DEFAULT_HTTP_PORT);
        if routers.is_empty() {
            warn!("Routers not found in router config: {value}");
            return;
        }
        self.replace_routers(routers);
        self.select_connection().await;
    }

    /// Adopts `routers` when it differs positionally from the known list.
    fn replace_routers(&mut self, routers: Vec<ServerAddress>) -> bool {
        if self.routers.is_empty() {
            info!(
                "Routers has been initialized to: {}",
                format_server_addresses(&routers)
            );
        } else if routers_changed(&self.routers, &routers) {
            info!(
                "Routers has been changed to: {}",
                format_server_addresses(&routers)
            );
        } else {
            return false;
        }
        self.routers = routers;
        true
    }

    /// Keeps the current server while it is still listed, otherwise connects to
    /// the first reachable router and hands the stream to the Sender.
    async fn select_connection(&mut self) {
        if let Some(current) = &self.current {
            if self.routers.contains(current) {
                return;
            }
        }

        for server in self.routers.clone() {
            let addr = server.to_string();
            let dialed = timeout(
                self.dial_timeout,
                TcpStream::connect((server.host.as_str(), server.port)),
            )
            .await;

            match dialed {
                Ok(Ok(stream)) => {
                    info!("Connected to {addr}.");
                    if self.connections.send(Connection::from(stream)).await.is_err() {
                        warn!("Sender is gone, connection to {addr} discarded");
                        return;
                    }
                    self.current = Some(server);
                    return;
                }
                Ok(Err(e)) => info!("Failed to connect to {addr}: {e}"),
                Err(_) => info!("Timed out connecting to {addr}"),
            }
        }

        info!("Cannot establish a connection to cat server.");
    }
}

fn routers_changed(old: &[ServerAddress], new: &[ServerAddress]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(a, b)| a != b)
}

#[async_trait]
impl Task for Router {
    fn name(&self) -> &'static str {
        "Router"
    }

    async fn after_start(&mut self) {
        let mut ticker = interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.update_router_config().await;
    }

    async fn before_stop(&mut self) {
        self.ticker = None;
        debug!("Router stopped polling");
    }

    async fn process(&mut self, inbox: &mut SignalInbox) -> Control {
        let Some(ticker) = self.ticker.as_mut() else {
            let signal = inbox.recv().await;
            return self.handle_signal(signal).await;
        };

        tokio::select! {
            signal = inbox.recv() => self.handle_signal(signal).await,
            _ = ticker.tick() => {
                self.update_router_config().await;
                Control::Continue
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) -> Control {
        match signal {
            Signal::ResetConnection => {
                warn!("Connection has been reset, reconnecting.");
                self.current = None;
                self.update_router_config().await;
                Control::Continue
            }
            other => default_handle_signal(self.name(), other),
        }
    }
}
