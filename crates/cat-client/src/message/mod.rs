// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message model: transactions, leaves, and the state they share.
//!
//! A [`Transaction`] owns an ordered list of child [`Message`]s and is the unit
//! of batching: only the transaction holding a [`Flush`] callback transmits,
//! carrying its whole subtree. Leaves ([`Event`], [`Heartbeat`], [`Metric`])
//! holding a callback transmit on their own as soon as they complete.

mod event;
pub mod header;
mod transaction;

pub use event::{Event, Heartbeat, Metric};
pub use header::{Header, MessageIdFactory};
pub use transaction::Transaction;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Arc;

/// Status sentinel of a successful message.
pub const SUCCESS: &str = "0";

/// Hand-off of a completed message to the transport layer. Must not block.
pub type Flush = Arc<dyn Fn(Message) + Send + Sync>;

/// Trace correlation ids carried by a message and copied into its frame header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    pub message_id: Option<String>,
    pub parent_id: Option<String>,
    pub root_id: Option<String>,
}

impl CorrelationContext {
    pub fn new(
        message_id: Option<String>,
        parent_id: Option<String>,
        root_id: Option<String>,
    ) -> Self {
        Self {
            message_id,
            parent_id,
            root_id,
        }
    }

    /// Context for a downstream call made on behalf of this one. The root is
    /// inherited, or becomes this message when the chain starts here.
    #[must_use]
    pub fn child(&self, child_message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(child_message_id.into()),
            parent_id: self.message_id.clone(),
            root_id: self.root_id.clone().or_else(|| self.message_id.clone()),
        }
    }
}

/// State every message kind embeds.
pub struct MessageBase {
    message_type: String,
    name: String,
    status: String,
    timestamp: DateTime<Local>,
    data: BytesMut,
    context: Option<CorrelationContext>,
    flush: Option<Flush>,
}

impl MessageBase {
    fn new(
        message_type: impl Into<String>,
        name: impl Into<String>,
        context: Option<CorrelationContext>,
        flush: Option<Flush>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            name: name.into(),
            status: SUCCESS.to_string(),
            timestamp: Local::now(),
            data: BytesMut::new(),
            context,
            flush,
        }
    }

    /// Moves the transmittable state out, leaving a completed shell behind.
    fn detach(&mut self) -> MessageBase {
        MessageBase {
            message_type: self.message_type.clone(),
            name: self.name.clone(),
            status: self.status.clone(),
            timestamp: self.timestamp,
            data: self.data.split(),
            context: self.context.clone(),
            flush: None,
        }
    }
}

impl fmt::Debug for MessageBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBase")
            .field("message_type", &self.message_type)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("timestamp", &self.timestamp)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("context", &self.context)
            .field("flush", &self.flush.is_some())
            .finish()
    }
}

/// Accessors shared by every message kind.
pub trait MessageFields {
    fn base(&self) -> &MessageBase;
    fn base_mut(&mut self) -> &mut MessageBase;

    fn message_type(&self) -> &str {
        &self.base().message_type
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    fn status(&self) -> &str {
        &self.base().status
    }

    fn is_success(&self) -> bool {
        self.base().status == SUCCESS
    }

    fn set_status(&mut self, status: impl Into<String>)
    where
        Self: Sized,
    {
        self.base_mut().status = status.into();
    }

    fn set_success(&mut self) {
        self.base_mut().status = SUCCESS.to_string();
    }

    fn timestamp(&self) -> DateTime<Local> {
        self.base().timestamp
    }

    fn set_timestamp(&mut self, timestamp: DateTime<Local>) {
        self.base_mut().timestamp = timestamp;
    }

    fn data(&self) -> &[u8] {
        &self.base().data
    }

    /// Replaces the payload.
    fn set_data(&mut self, data: impl AsRef<[u8]>)
    where
        Self: Sized,
    {
        let buf = &mut self.base_mut().data;
        buf.clear();
        buf.put_slice(data.as_ref());
    }

    /// Appends a `key=value` pair, `&`-separated from earlier pairs.
    fn add_data(&mut self, key: &str, value: &str) {
        let buf = &mut self.base_mut().data;
        if !buf.is_empty() {
            buf.put_u8(b'&');
        }
        buf.put_slice(key.as_bytes());
        if !value.is_empty() {
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
        }
    }

    fn context(&self) -> Option<&CorrelationContext> {
        self.base().context.as_ref()
    }
}

impl MessageFields for MessageBase {
    fn base(&self) -> &MessageBase {
        self
    }

    fn base_mut(&mut self) -> &mut MessageBase {
        self
    }
}

/// Any message that can travel on its own or as a transaction child.
#[derive(Debug)]
pub enum Message {
    Transaction(Transaction),
    Event(Event),
    Heartbeat(Heartbeat),
    Metric(Metric),
}

impl Message {
    /// Lower-case kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Transaction(_) => "transaction",
            Message::Event(_) => "event",
            Message::Heartbeat(_) => "heartbeat",
            Message::Metric(_) => "metric",
        }
    }

    /// Marks the message complete without transmitting it.
    pub(crate) fn finalize(&mut self) {
        match self {
            Message::Transaction(transaction) => transaction.finalize(),
            Message::Event(event) => event.finalize(),
            Message::Heartbeat(heartbeat) => heartbeat.finalize(),
            Message::Metric(metric) => metric.finalize(),
        }
    }
}

impl MessageFields for Message {
    fn base(&self) -> &MessageBase {
        match self {
            Message::Transaction(m) => m.base(),
            Message::Event(m) => m.base(),
            Message::Heartbeat(m) => m.base(),
            Message::Metric(m) => m.base(),
        }
    }

    fn base_mut(&mut self) -> &mut MessageBase {
        match self {
            Message::Transaction(m) => m.base_mut(),
            Message::Event(m) => m.base_mut(),
            Message::Heartbeat(m) => m.base_mut(),
            Message::Metric(m) => m.base_mut(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind(), self.message_type(), self.name())
    }
}

impl From<Transaction> for Message {
    fn from(value: Transaction) -> Self {
        Message::Transaction(value)
    }
}
