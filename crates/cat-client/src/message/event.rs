// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{CorrelationContext, Flush, Message, MessageBase, MessageFields};
use tracing::warn;

macro_rules! leaf_message {
    ($(#[$meta:meta])* $kind:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $kind {
            base: MessageBase,
            completed: bool,
        }

        impl $kind {
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
                    completed: false,
                }
            }

            pub fn is_completed(&self) -> bool {
                self.completed
            }

            /// Marks the message complete and transmits it when it holds a
            /// flush callback. Completing twice has no effect.
            pub fn complete(&mut self) {
                if self.completed {
                    warn!(
                        "{} {}/{} has already been completed",
                        stringify!($kind),
                        self.base.message_type,
                        self.base.name
                    );
                    return;
                }
                self.completed = true;

                if let Some(flush) = self.base.flush.take() {
                    flush(Message::$kind(Self {
                        base: self.base.detach(),
                        completed: true,
                    }));
                }
            }

            pub(crate) fn finalize(&mut self) {
                self.completed = true;
            }
        }

        impl MessageFields for $kind {
            fn base(&self) -> &MessageBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut MessageBase {
                &mut self.base
            }
        }

        impl From<$kind> for Message {
            fn from(value: $kind) -> Self {
                Message::$kind(value)
            }
        }
    };
}

leaf_message!(
    /// A point-in-time occurrence.
    Event
);

leaf_message!(
    /// A periodic status report; its payload is an opaque document.
    Heartbeat
);

leaf_message!(
    /// A business metric sample.
    Metric
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_leaf_with_flush_transmits_on_complete() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let flush: Flush = Arc::new(move |message: Message| {
            sink.lock().unwrap().push(message.to_string());
        });

        let mut event = Event::new("System", "Reboot", Some(flush.clone()));
        event.add_data("reason", "deploy");
        event.complete();
        event.complete();

        let mut metric = Metric::new("Order", "count", Some(flush));
        metric.complete();

        assert_eq!(
            *flushed.lock().unwrap(),
            vec!["event System/Reboot", "metric Order/count"]
        );
    }

    #[test]
    fn test_leaf_keeps_context() {
        let context = CorrelationContext::new(Some("m1".to_string()), None, None);
        let heartbeat = Heartbeat::with_context("Heartbeat", "10.0.0.1", Some(context.clone()), None);
        assert_eq!(heartbeat.context(), Some(&context));
        assert!(!heartbeat.is_completed());
    }
}
