// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CorrelationContext, Event, Flush, Message, MessageBase, MessageFields};
use chrono::{DateTime, Local};
use std::mem;
use std::time::{Duration, Instant};
use tracing::warn;

/// A timed unit of work owning an ordered list of children.
#[derive(Debug)]
pub struct Transaction {
    base: MessageBase,
    children: Vec<Message>,
    started: Instant,
    duration: Option<Duration>,
    completed: bool,
}

impl Transaction {
    pub fn new(
        message_type: impl Into<String>,
        name: impl Into<String>,
        flush: Option<Flush>,
    ) -> Self {
        Self::with_context(message_type, name, None, flush)
    }

    pub fn with_context(
        message_type: impl Into<String>,
        name: impl Into<String>,
        context: Option<CorrelationContext>,
        flush: Option<Flush>,
    ) -> Self {
        Self {
            base: MessageBase::new(message_type, name, context, flush),
            children: Vec::new(),
            started: Instant::now(),
            duration: None,
            completed: false,
        }
    }

    pub fn children(&self) -> &[Message] {
        &self.children
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Appends a child. Children added after completion are discarded.
    pub fn add_child(&mut self, child: Message) {
        if self.completed {
            warn!(
                "Transaction {}/{} has been completed, {child} discarded",
                self.base.message_type, self.base.name
            );
            return;
        }
        self.children.push(child);
    }

    /// Records a completed event as the next child.
    pub fn log_event(
        &mut self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        status: impl Into<String>,
        data: impl AsRef<[u8]>,
    ) {
        let mut event = Event::new(message_type, name, None);
        event.set_status(status);
        event.set_data(data);
        event.complete();
        self.add_child(event.into());
    }

    /// Elapsed time since creation, frozen at completion. An explicit duration
    /// always wins.
    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    /// Moment the transaction finished: its timestamp plus its duration.
    pub fn completed_at(&self) -> DateTime<Local> {
        let elapsed = chrono::Duration::from_std(self.duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base
            .timestamp
            .checked_add_signed(elapsed)
            .unwrap_or(self.base.timestamp)
    }

    /// Freezes the duration and, for a root transaction, hands the whole subtree
    /// to the flush callback. Completing twice has no effect.
    pub fn complete(&mut self) {
        if self.completed {
            warn!(
                "Transaction {}/{} has already been completed",
                self.base.message_type, self.base.name
            );
            return;
        }
        self.completed = true;

        for child in &mut self.children {
            child.finalize();
        }
        let duration = self.duration();
        self.duration = Some(duration);

        if let Some(flush) = self.base.flush.take() {
            let finished = Transaction {
                base: self.base.detach(),
                children: mem::take(&mut self.children),
                started: self.started,
                duration: Some(duration),
                completed: true,
            };
            flush(finished.into());
        }
    }

    /// Freezes this subtree without transmitting it. Used for children that were
    /// still open when their parent completed.
    pub(crate) fn finalize(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        for child in &mut self.children {
            child.finalize();
        }
        self.duration = Some(self.duration());
    }
}

impl MessageFields for Transaction {
    fn base(&self) -> &MessageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MessageBase {
        &mut self.base
    }
}
