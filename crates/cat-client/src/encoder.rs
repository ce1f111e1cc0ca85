// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Readable text protocol.
//!
//! A frame body is a header line followed by one line per message, depth first.
//! Fields are tab-terminated and lines end with `\n`.

use crate::errors::EncodeError;
use crate::message::{
    Event, Header, Heartbeat, Message, MessageBase, MessageFields, Metric, Transaction,
};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use std::time::Duration;

pub const READABLE_PROTOCOL: &str = "PT1";

const THREAD_GROUP_NAME: &str = "cat";
const THREAD_ID: &str = "0";
const THREAD_NAME: &str = "cat";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const TAB: u8 = b'\t';
const LF: u8 = b'\n';

/// Which fields follow the leader on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    /// timestamp, type, name
    WithoutStatus,
    /// timestamp, type, name, status, duration, payload
    WithDuration,
    /// timestamp, type, name, status, payload
    Default,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadableEncoder;

impl ReadableEncoder {
    pub fn encode_header(&self, buf: &mut BytesMut, header: &Header) {
        for field in [
            READABLE_PROTOCOL,
            header.domain.as_str(),
            header.hostname.as_str(),
            header.ip.as_str(),
            THREAD_GROUP_NAME,
            THREAD_ID,
            THREAD_NAME,
            header.message_id.as_str(),
            header.parent_message_id.as_str(),
            header.root_message_id.as_str(),
        ] {
            write_field(buf, field.as_bytes());
        }
        // empty session token
        buf.put_u8(LF);
    }

    /// Appends the lines of `message` to `buf`. On error the buffer holds a
    /// partial frame and must be discarded.
    pub fn encode_message(&self, buf: &mut BytesMut, message: &Message) -> Result<(), EncodeError> {
        match message {
            Message::Transaction(transaction) => self.encode_transaction(buf, transaction),
            Message::Event(event) => self.encode_event(buf, event),
            Message::Heartbeat(heartbeat) => self.encode_heartbeat(buf, heartbeat),
            Message::Metric(metric) => self.encode_metric(buf, metric),
        }
    }

    pub fn encode_transaction(
        &self,
        buf: &mut BytesMut,
        transaction: &Transaction,
    ) -> Result<(), EncodeError> {
        let base = transaction.base();
        let duration = transaction.duration();
        let completed_at = transaction.completed_at();

        if transaction.children().is_empty() {
            return encode_line(buf, base, b'A', Policy::WithDuration, completed_at, duration);
        }

        encode_line(buf, base, b't', Policy::WithoutStatus, base.timestamp(), duration)?;
        for child in transaction.children() {
            self.encode_message(buf, child)?;
        }
        encode_line(buf, base, b'T', Policy::WithDuration, completed_at, duration)
    }

    pub fn encode_event(&self, buf: &mut BytesMut, event: &Event) -> Result<(), EncodeError> {
        encode_leaf(buf, event.base(), b'E')
    }

    pub fn encode_heartbeat(
        &self,
        buf: &mut BytesMut,
        heartbeat: &Heartbeat,
    ) -> Result<(), EncodeError> {
        encode_leaf(buf, heartbeat.base(), b'H')
    }

    pub fn encode_metric(&self, buf: &mut BytesMut, metric: &Metric) -> Result<(), EncodeError> {
        encode_leaf(buf, metric.base(), b'M')
    }
}

/// Big-endian length prefix of a frame body.
pub fn length_prefix(len: usize) -> Result<[u8; 4], EncodeError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| EncodeError::FrameTooLarge(len))
}

fn encode_leaf(buf: &mut BytesMut, base: &MessageBase, leader: u8) -> Result<(), EncodeError> {
    encode_line(
        buf,
        base,
        leader,
        Policy::Default,
        base.timestamp(),
        Duration::ZERO,
    )
}

fn encode_line(
    buf: &mut BytesMut,
    base: &MessageBase,
    leader: u8,
    policy: Policy,
    timestamp: DateTime<Local>,
    duration: Duration,
) -> Result<(), EncodeError> {
    check_field("type", base.message_type())?;
    check_field("name", base.name())?;
    if policy != Policy::WithoutStatus {
        check_field("status", base.status())?;
    }

    buf.put_u8(leader);
    write_field(buf, timestamp.format(TIMESTAMP_FORMAT).to_string().as_bytes());
    write_field(buf, base.message_type().as_bytes());
    write_field(buf, base.name().as_bytes());

    if policy != Policy::WithoutStatus {
        write_field(buf, base.status().as_bytes());
        if policy == Policy::WithDuration {
            buf.put_slice(duration.as_micros().to_string().as_bytes());
            write_field(buf, b"us");
        }
        write_field(buf, base.data());
    }

    buf.put_u8(LF);
    Ok(())
}

fn write_field(buf: &mut BytesMut, field: &[u8]) {
    buf.put_slice(field);
    buf.put_u8(TAB);
}

fn check_field(field: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.contains(['\t', '\n']) {
        return Err(EncodeError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
