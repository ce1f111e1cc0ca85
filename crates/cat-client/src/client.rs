// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client entry point.

use crate::config::{ClientConfig, Identity};
use crate::errors::{ClientError, TaskError};
use crate::message::{
    CorrelationContext, Event, Flush, Heartbeat, Message, MessageFields, MessageIdFactory, Metric,
    Transaction,
};
use crate::monitor::{Monitor, StatusCollector};
use crate::router::{Router, TrafficSwitch};
use crate::sender::{Sender, SenderHandle};
use crate::task::{self, signal_channel, TaskHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A running client: background tasks plus the factories that bind new
/// messages to them.
pub struct CatClient {
    identity: Arc<Identity>,
    ids: Arc<MessageIdFactory>,
    flush: Flush,
    switch: TrafficSwitch,
    sample_rate: watch::Receiver<f64>,
    tasks: Vec<TaskHandle>,
    shutdown_timeout: Duration,
}

impl CatClient {
    /// Validates `config` and starts the Sender, Router and, when enabled, the
    /// Monitor. Must be called from within a tokio runtime.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        Self::start_with_collectors(config, Vec::new()).await
    }

    /// Like [`CatClient::start`], reporting `collectors` in every status
    /// heartbeat next to the built-in system collector.
    pub async fn start_with_collectors(
        config: ClientConfig,
        collectors: Vec<Box<dyn StatusCollector>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let identity = Arc::new(config.identity());
        let ids = Arc::new(MessageIdFactory::new(&identity.domain, &identity.ip_hex));
        let switch = TrafficSwitch::default();

        let (router_signals, router_inbox) = signal_channel();
        let (sender, sender_handle) =
            Sender::new(&config, identity.clone(), ids.clone(), router_signals.clone());
        let (router, sample_rate) = Router::new(
            &config,
            identity.clone(),
            sender_handle.connections(),
            switch.clone(),
        )?;
        let flush = dispatcher(sender_handle, switch.clone());

        let mut tasks = Vec::with_capacity(3);
        let (sender_signals, sender_inbox) = signal_channel();
        tasks.push(task::spawn(sender, sender_signals, sender_inbox));
        tasks.push(task::spawn(router, router_signals, router_inbox));
        if config.enable_monitor {
            let (monitor_signals, monitor_inbox) = signal_channel();
            let mut monitor = Monitor::new(flush.clone(), identity.ip.as_str());
            for collector in collectors {
                monitor.add_collector(collector);
            }
            tasks.push(task::spawn(monitor, monitor_signals, monitor_inbox));
        }

        info!(
            "Cat client started for domain {} on {} ({})",
            identity.domain, identity.hostname, identity.ip
        );

        Ok(CatClient {
            identity,
            ids,
            flush,
            switch,
            sample_rate,
            tasks,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn new_transaction(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Transaction {
        Transaction::new(message_type, name, Some(self.flush.clone()))
    }

    pub fn new_transaction_with_context(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        context: CorrelationContext,
    ) -> Transaction {
        Transaction::with_context(message_type, name, Some(context), Some(self.flush.clone()))
    }

    pub fn new_event(&self, message_type: impl Into<String>, name: impl Into<String>) -> Event {
        Event::new(message_type, name, Some(self.flush.clone()))
    }

    pub fn new_event_with_context(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        context: CorrelationContext,
    ) -> Event {
        Event::with_context(message_type, name, Some(context), Some(self.flush.clone()))
    }

    pub fn new_heartbeat(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Heartbeat {
        Heartbeat::new(message_type, name, Some(self.flush.clone()))
    }

    pub fn new_metric(&self, message_type: impl Into<String>, name: impl Into<String>) -> Metric {
        Metric::new(message_type, name, Some(self.flush.clone()))
    }

    /// Sends a standalone, already completed event.
    pub fn log_event(
        &self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        status: impl Into<String>,
        data: impl AsRef<[u8]>,
    ) {
        let mut event = self.new_event(message_type, name);
        event.set_status(status);
        event.set_data(data);
        event.complete();
    }

    pub fn next_message_id(&self) -> String {
        self.ids.next_id()
    }

    /// Sample rate last published by the routing API, 1.0 until then.
    pub fn sample_rate(&self) -> f64 {
        *self.sample_rate.borrow()
    }

    /// False while the routing API blocks traffic.
    pub fn is_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    /// Stops Monitor, Router and Sender in that order. The Sender drains what is
    /// still queued. Every task is stopped even when an earlier one fails; the
    /// first failure is returned.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let mut first_error: Option<TaskError> = None;
        for handle in self.tasks.into_iter().rev() {
            let name = handle.name();
            match handle.stop_with_timeout(self.shutdown_timeout).await {
                Ok(()) => debug!("{name} task stopped"),
                Err(e) => {
                    error!("Failed to stop {name} task: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!("Cat client has been shut down");
                Ok(())
            }
        }
    }
}

/// Flush callback shared by every message the client creates.
fn dispatcher(sender: SenderHandle, switch: TrafficSwitch) -> Flush {
    Arc::new(move |message: Message| {
        if !switch.is_enabled() {
            debug!("Traffic is blocked, {message} discarded");
            return;
        }
        sender.handle(message);
    })
}
