// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitor task: reports host status once a minute.
//!
//! Each report is a `System`/`Status` transaction carrying one heartbeat whose
//! payload is an XML `<status>` document built from the registered collectors.

use crate::message::{Event, Flush, Heartbeat, MessageFields, Transaction};
use crate::task::{Control, SignalInbox, Task};
use async_trait::async_trait;
use chrono::{Local, Timelike};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use sysinfo::System;
use tracing::debug;

pub const TYPE_SYSTEM: &str = "System";
pub const NAME_REBOOT: &str = "Reboot";
pub const NAME_STATUS: &str = "Status";
pub const TYPE_HEARTBEAT: &str = "Heartbeat";

const CLIENT_VERSION_KEY: &str = "cat-client-version";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Host attributes reported on the `<os>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsInfo {
    pub name: String,
    pub arch: String,
    pub version: String,
    pub available_processors: String,
    pub system_load_average: String,
    pub total_physical_memory: String,
    pub free_physical_memory: String,
    pub total_swap_space: String,
    pub free_swap_space: String,
}

/// A source of status properties, rendered as one `<extension>` element.
pub trait StatusCollector: Send {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Samples the current values. Called once per report, before `fill_os`.
    fn properties(&mut self) -> BTreeMap<String, String>;

    /// Contributes to the `<os>` element from the last sample.
    fn fill_os(&self, _os: &mut OsInfo) {}
}

/// Load average, memory and swap from the host.
pub struct SystemCollector {
    system: System,
    load_average: Option<f64>,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self {
            system: System::new(),
            load_average: None,
        }
    }
}

impl StatusCollector for SystemCollector {
    fn id(&self) -> &str {
        "System"
    }

    fn description(&self) -> &str {
        "System"
    }

    fn properties(&mut self) -> BTreeMap<String, String> {
        self.system.refresh_memory();
        let load = System::load_average().one;
        self.load_average = Some(load);

        BTreeMap::from([
            ("LoadAverage".to_string(), format!("{load:.6}")),
            (
                "FreePhysicalMemory".to_string(),
                self.system.free_memory().to_string(),
            ),
            (
                "FreeSwapSpaceSize".to_string(),
                self.system.free_swap().to_string(),
            ),
        ])
    }

    fn fill_os(&self, os: &mut OsInfo) {
        if let Some(load) = self.load_average {
            os.system_load_average = format!("{load:.6}");
        }
        os.total_physical_memory = self.system.total_memory().to_string();
        os.free_physical_memory = self.system.free_memory().to_string();
        os.total_swap_space = self.system.total_swap().to_string();
        os.free_swap_space = self.system.free_swap().to_string();
    }
}

pub struct Monitor {
    flush: Flush,
    ip: String,
    collectors: Vec<Box<dyn StatusCollector>>,
}

impl Monitor {
    pub fn new(flush: Flush, ip: impl Into<String>) -> Self {
        Self {
            flush,
            ip: ip.into(),
            collectors: vec![Box::new(SystemCollector::default())],
        }
    }

    pub fn add_collector(&mut self, collector: Box<dyn StatusCollector>) {
        self.collectors.push(collector);
    }

    fn collect_and_send(&mut self) {
        let mut transaction = Transaction::new(TYPE_SYSTEM, NAME_STATUS, Some(self.flush.clone()));

        let mut heartbeat = Heartbeat::new(TYPE_HEARTBEAT, self.ip.as_str(), None);
        heartbeat.set_data(self.build_status());
        heartbeat.complete();

        transaction.add_child(heartbeat.into());
        transaction.complete();
    }

    fn build_status(&mut self) -> String {
        let mut os = OsInfo {
            name: System::name().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            version: System::os_version().unwrap_or_default(),
            available_processors: std::thread::available_parallelism()
                .map_or(1, |count| count.get())
                .to_string(),
            ..Default::default()
        };

        let mut extensions = String::new();
        for collector in &mut self.collectors {
            let properties = collector.properties();
            collector.fill_os(&mut os);

            extensions.push_str(&format!(
                r#"<extension id="{}"><description>{}</description>"#,
                escape(collector.id()),
                escape(collector.description())
            ));
            for (id, value) in &properties {
                extensions.push_str(&format!(
                    r#"<extensionDetail id="{}" value="{}"/>"#,
                    escape(id),
                    escape(value)
                ));
            }
            extensions.push_str("</extension>");
        }

        let mut status = String::new();
        status.push_str(&format!(
            r#"<status timestamp="{}">"#,
            Local::now().format(TIMESTAMP_FORMAT)
        ));
        status.push_str(&format!(
            concat!(
                r#"<os name="{}" arch="{}" version="{}" available-processors="{}" "#,
                r#"system-load-average="{}" total-physical-memory="{}" "#,
                r#"free-physical-memory="{}" total-swap-space="{}" free-swap-space="{}"/>"#
            ),
            escape(&os.name),
            escape(&os.arch),
            escape(&os.version),
            escape(&os.available_processors),
            escape(&os.system_load_average),
            escape(&os.total_physical_memory),
            escape(&os.free_physical_memory),
            escape(&os.total_swap_space),
            escape(&os.free_swap_space),
        ));
        status.push_str(&extensions);
        status.push_str(&format!(
            r#"<customInfo key="{CLIENT_VERSION_KEY}" value="{}"/>"#,
            env!("CARGO_PKG_VERSION")
        ));
        status.push_str("</status>");
        status
    }
}

/// Time left until the next minute boundary.
fn until_next_minute() -> Duration {
    Duration::from_secs(60 - u64::from(Local::now().second() % 60))
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

#[async_trait]
impl Task for Monitor {
    fn name(&self) -> &'static str {
        "Monitor"
    }

    async fn after_start(&mut self) {
        let mut reboot = Event::new(TYPE_SYSTEM, NAME_REBOOT, Some(self.flush.clone()));
        reboot.complete();
        self.collect_and_send();
    }

    async fn process(&mut self, inbox: &mut SignalInbox) -> Control {
        let wait = until_next_minute();
        tokio::select! {
            signal = inbox.recv() => self.handle_signal(signal).await,
            () = tokio::time::sleep(wait) => {
                debug!("Monitor collecting status");
                self.collect_and_send();
                Control::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::{Arc, Mutex};

    struct StaticCollector;

    impl StatusCollector for StaticCollector {
        fn id(&self) -> &str {
            "queue"
        }

        fn description(&self) -> &str {
            "Order <queue>"
        }

        fn properties(&mut self) -> BTreeMap<String, String> {
            BTreeMap::from([("depth".to_string(), "7".to_string())])
        }

        fn fill_os(&self, os: &mut OsInfo) {
            os.system_load_average = "0.5".to_string();
        }
    }

    fn capture() -> (Flush, Arc<Mutex<Vec<Message>>>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let flush: Flush = Arc::new(move |message: Message| sink.lock().unwrap().push(message));
        (flush, flushed)
    }

    fn monitor_with_static(flush: Flush) -> Monitor {
        Monitor {
            flush,
            ip: "10.0.0.7".to_string(),
            collectors: vec![Box::new(StaticCollector)],
        }
    }

    #[test]
    fn test_build_status_document() {
        let (flush, _) = capture();
        let status = monitor_with_static(flush).build_status();

        assert!(status.starts_with("<status timestamp=\""));
        assert!(status.ends_with("</status>"));
        assert!(status.contains(r#"system-load-average="0.5""#));
        assert!(status.find("<os ").unwrap() < status.find("<extension ").unwrap());
        assert!(status.contains(
            r#"<extension id="queue"><description>Order &lt;queue&gt;</description><extensionDetail id="depth" value="7"/></extension>"#
        ));
        assert!(status.contains(&format!(
            r#"<customInfo key="cat-client-version" value="{}"/>"#,
            env!("CARGO_PKG_VERSION")
        )));
    }

    #[test]
    fn test_system_collector_properties() {
        let mut collector = SystemCollector::default();
        let properties = collector.properties();

        assert!(properties.contains_key("LoadAverage"));
        assert!(properties.contains_key("FreePhysicalMemory"));
        assert!(properties.contains_key("FreeSwapSpaceSize"));

        let mut os = OsInfo::default();
        collector.fill_os(&mut os);
        assert!(!os.total_physical_memory.is_empty());
    }

    #[test]
    fn test_status_report_is_transaction_with_heartbeat() {
        let (flush, flushed) = capture();
        monitor_with_static(flush).collect_and_send();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        let Message::Transaction(transaction) = &flushed[0] else {
            panic!("expected a transaction, got {}", flushed[0]);
        };
        assert_eq!(transaction.message_type(), TYPE_SYSTEM);
        assert_eq!(transaction.name(), NAME_STATUS);
        assert_eq!(transaction.children().len(), 1);

        let heartbeat = &transaction.children()[0];
        assert_eq!(heartbeat.kind(), "heartbeat");
        assert_eq!(heartbeat.name(), "10.0.0.7");
        assert!(heartbeat.data().starts_with(b"<status"));
    }

    #[tokio::test]
    async fn test_after_start_reports_reboot_then_status() {
        let (flush, flushed) = capture();
        let mut monitor = monitor_with_static(flush);
        monitor.after_start().await;

        let flushed = flushed.lock().unwrap();
        let names: Vec<String> = flushed.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["event System/Reboot", "transaction System/Status"]);
    }

    #[test]
    fn test_until_next_minute_is_bounded() {
        let wait = until_next_minute();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape(r#"a&b"c'"#), "a&amp;b&quot;c&apos;");
    }
}
