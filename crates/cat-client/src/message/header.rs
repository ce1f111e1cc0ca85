// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CorrelationContext;
use crate::config::Identity;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SECONDS_PER_HOUR: u64 = 3600;

/// Frame header, built fresh for every outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub domain: String,
    pub hostname: String,
    pub ip: String,
    pub message_id: String,
    pub parent_message_id: String,
    pub root_message_id: String,
}

impl Header {
    /// Combines the process identity with the message's correlation context.
    /// A message without its own id gets a freshly generated one.
    pub fn new(
        identity: &Identity,
        context: Option<&CorrelationContext>,
        ids: &MessageIdFactory,
    ) -> Self {
        let context = context.cloned().unwrap_or_default();
        Self {
            domain: identity.domain.clone(),
            hostname: identity.hostname.clone(),
            ip: identity.ip.clone(),
            message_id: context.message_id.unwrap_or_else(|| ids.next_id()),
            parent_message_id: context.parent_id.unwrap_or_default(),
            root_message_id: context.root_id.unwrap_or_default(),
        }
    }
}

/// Generates `{domain}-{ip_hex}-{hour}-{sequence}` message ids.
///
/// The sequence restarts at zero whenever the hour since the Unix epoch changes.
#[derive(Debug)]
pub struct MessageIdFactory {
    prefix: String,
    hour: AtomicU64,
    sequence: AtomicU64,
}

impl MessageIdFactory {
    pub fn new(domain: &str, ip_hex: &str) -> Self {
        Self {
            prefix: format!("{domain}-{ip_hex}"),
            hour: AtomicU64::new(current_hour()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        self.next_id_at(current_hour())
    }

    fn next_id_at(&self, hour: u64) -> String {
        let last = self.hour.load(Ordering::Acquire);
        if hour != last
            && self
                .hour
                .compare_exchange(last, hour, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.sequence.store(0, Ordering::Release);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        format!("{}-{hour}-{sequence}", self.prefix)
    }
}

fn current_hour() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / SECONDS_PER_HOUR)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            domain: "order-service".to_string(),
            env: "dev".to_string(),
            hostname: "box-1".to_string(),
            ip: "10.0.0.7".to_string(),
            ip_hex: "0a000007".to_string(),
        }
    }

    #[test]
    fn test_sequence_restarts_on_new_hour() {
        let ids = MessageIdFactory::new("order-service", "0a000007");
        let hour = current_hour();

        assert_eq!(ids.next_id_at(hour), format!("order-service-0a000007-{hour}-0"));
        assert_eq!(ids.next_id_at(hour), format!("order-service-0a000007-{hour}-1"));
        assert_eq!(
            ids.next_id_at(hour + 1),
            format!("order-service-0a000007-{}-0", hour + 1)
        );
    }

    #[test]
    fn test_header_generates_id_without_context() {
        let ids = MessageIdFactory::new("order-service", "0a000007");
        let header = Header::new(&identity(), None, &ids);

        assert!(header.message_id.starts_with("order-service-0a000007-"));
        assert!(header.parent_message_id.is_empty());
        assert!(header.root_message_id.is_empty());
        assert_eq!(header.hostname, "box-1");
    }

    #[test]
    fn test_header_uses_context_ids() {
        let ids = MessageIdFactory::new("order-service", "0a000007");
        let context = CorrelationContext::new(
            Some("m3".to_string()),
            Some("m2".to_string()),
            Some("m1".to_string()),
        );
        let header = Header::new(&identity(), Some(&context), &ids);

        assert_eq!(header.message_id, "m3");
        assert_eq!(header.parent_message_id, "m2");
        assert_eq!(header.root_message_id, "m1");
    }
}
