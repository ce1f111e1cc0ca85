// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background task lifecycle.
//!
//! Each component implements [`Task`] and is driven by [`spawn`]: `after_start`,
//! then `process` until it returns [`Control::Exit`], then `before_stop`. Tasks
//! are steered through a bounded signal inbox.

use crate::errors::TaskError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SIGNAL_INBOX_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Exit,
    ResetConnection,
}

/// Outcome of one run loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Exit,
}

/// Sending half of a task's signal inbox.
#[derive(Debug, Clone)]
pub struct Signals {
    tx: mpsc::Sender<Signal>,
}

impl Signals {
    /// Delivers a signal without waiting. Returns false when the inbox is full
    /// or the task is gone.
    pub fn try_signal(&self, signal: Signal) -> bool {
        self.tx.try_send(signal).is_ok()
    }

    /// Delivers a signal, waiting for room in the inbox.
    pub async fn signal(&self, signal: Signal) -> bool {
        self.tx.send(signal).await.is_ok()
    }
}

#[derive(Debug)]
pub struct SignalInbox {
    rx: mpsc::Receiver<Signal>,
}

impl SignalInbox {
    /// Next signal. A closed inbox reads as [`Signal::Exit`].
    pub async fn recv(&mut self) -> Signal {
        self.rx.recv().await.unwrap_or(Signal::Exit)
    }

    pub fn try_recv(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }
}

pub fn signal_channel() -> (Signals, SignalInbox) {
    let (tx, rx) = mpsc::channel(SIGNAL_INBOX_SIZE);
    (Signals { tx }, SignalInbox { rx })
}

#[async_trait]
pub trait Task: Send + 'static {
    fn name(&self) -> &'static str;

    async fn after_start(&mut self) {}

    async fn before_stop(&mut self) {}

    /// One step of the run loop. Implementations wait on the inbox alongside
    /// their own sources and return [`Control::Exit`] to end the loop.
    async fn process(&mut self, inbox: &mut SignalInbox) -> Control;

    async fn handle_signal(&mut self, signal: Signal) -> Control {
        default_handle_signal(self.name(), signal)
    }
}

/// `Exit` ends the loop, anything else is logged and ignored.
pub fn default_handle_signal(name: &str, signal: Signal) -> Control {
    match signal {
        Signal::Exit => {
            debug!("{name} received exit signal");
            Control::Exit
        }
        other => {
            warn!("{name} ignored unsupported signal {other:?}");
            Control::Continue
        }
    }
}

pub struct TaskHandle {
    name: &'static str,
    signals: Signals,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Sends `Exit` and waits for the task to run its `before_stop` hook.
    pub async fn stop(self) -> Result<(), TaskError> {
        self.signals.signal(Signal::Exit).await;
        self.join
            .await
            .map_err(|e| TaskError::Join(self.name, e.to_string()))
    }

    /// Like [`TaskHandle::stop`], aborting the task when it does not finish in time.
    pub async fn stop_with_timeout(self, timeout: Duration) -> Result<(), TaskError> {
        let TaskHandle {
            name,
            signals,
            mut join,
        } = self;

        let stopped = tokio::time::timeout(timeout, async {
            signals.signal(Signal::Exit).await;
            (&mut join).await
        })
        .await;

        match stopped {
            Ok(joined) => joined.map_err(|e| TaskError::Join(name, e.to_string())),
            Err(_) => {
                join.abort();
                Err(TaskError::ShutdownTimeout(name))
            }
        }
    }
}

/// Runs `task` on the tokio runtime.
pub fn spawn<T: Task>(mut task: T, signals: Signals, mut inbox: SignalInbox) -> TaskHandle {
    let name = task.name();
    let join = tokio::spawn(async move {
        debug!("{name} started");
        task.after_start().await;
        while task.process(&mut inbox).await == Control::Continue {}
        task.before_stop().await;
        debug!("{name} stopped");
    });

    TaskHandle {
        name,
        signals,
        join,
    }
}
