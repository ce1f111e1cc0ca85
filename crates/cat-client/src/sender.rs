// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender task: owns the collector connection and writes framed messages.

use crate::config::{ClientConfig, DropPolicy, Identity, QueueConfig};
use crate::encoder::{length_prefix, ReadableEncoder};
use crate::message::{
    Event, Header, Heartbeat, Message, MessageFields, MessageIdFactory, Metric, Transaction,
};
use crate::task::{Control, Signal, SignalInbox, Signals, Task};
use async_trait::async_trait;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// A writable stream to a collector.
pub struct Connection {
    peer: String,
    stream: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            peer: peer.into(),
            stream: Box::new(stream),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn write_frame(&mut self, prefix: &[u8], body: &[u8]) -> io::Result<()> {
        self.stream.write_all(prefix).await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        Connection::new(peer, stream)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

#[derive(Debug, Clone)]
struct PriorityQueue {
    name: &'static str,
    tx: mpsc::Sender<Message>,
    drop_policy: DropPolicy,
}

impl PriorityQueue {
    fn offer(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                if self.drop_policy == DropPolicy::Warn {
                    warn!(
                        "{} priority channel is full, {message} has been discarded.",
                        self.name
                    );
                }
                false
            }
            Err(TrySendError::Closed(message)) => {
                debug!("{} priority channel is closed, {message} discarded", self.name);
                false
            }
        }
    }
}

fn priority_queue(
    name: &'static str,
    config: QueueConfig,
) -> (PriorityQueue, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(config.capacity);
    let queue = PriorityQueue {
        name,
        tx,
        drop_policy: config.drop_policy,
    };
    (queue, rx)
}

/// Producer side of the Sender. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct SenderHandle {
    normal: PriorityQueue,
    high: PriorityQueue,
    connections: mpsc::Sender<Connection>,
}

impl SenderHandle {
    /// Failed transactions go to the high priority queue, the rest to normal.
    pub fn handle_transaction(&self, transaction: Transaction) -> bool {
        if transaction.is_success() {
            self.normal.offer(transaction.into())
        } else {
            self.high.offer(transaction.into())
        }
    }

    pub fn handle_event(&self, event: Event) -> bool {
        self.normal.offer(event.into())
    }

    pub fn handle_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        self.normal.offer(heartbeat.into())
    }

    pub fn handle_metric(&self, metric: Metric) -> bool {
        self.normal.offer(metric.into())
    }

    /// Routes a completed message to its queue. Returns false when it was dropped.
    pub fn handle(&self, message: Message) -> bool {
        match message {
            Message::Transaction(transaction) => self.handle_transaction(transaction),
            Message::Event(event) => self.handle_event(event),
            Message::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat),
            Message::Metric(metric) => self.handle_metric(metric),
        }
    }

    /// Hand-off channel the router uses to install a new connection.
    pub fn connections(&self) -> mpsc::Sender<Connection> {
        self.connections.clone()
    }
}

pub struct Sender {
    identity: Arc<Identity>,
    ids: Arc<MessageIdFactory>,
    encoder: ReadableEncoder,
    buf: BytesMut,
    normal: mpsc::Receiver<Message>,
    high: mpsc::Receiver<Message>,
    connections: mpsc::Receiver<Connection>,
    conn: Option<Connection>,
    router: Signals,
    write_timeout: Duration,
}

impl Sender {
    pub fn new(
        config: &ClientConfig,
        identity: Arc<Identity>,
        ids: Arc<MessageIdFactory>,
        router: Signals,
    ) -> (Self, SenderHandle) {
        let (normal, normal_rx) = priority_queue("Normal", config.normal_queue);
        let (high, high_rx) = priority_queue("High", config.high_queue);
        // a pending connection is superseded by the next one only after it is taken
        let (connections_tx, connections_rx) = mpsc::channel(1);

        let sender = Sender {
            identity,
            ids,
            encoder: ReadableEncoder,
            buf: BytesMut::with_capacity(4096),
            normal: normal_rx,
            high: high_rx,
            connections: connections_rx,
            conn: None,
            router,
            write_timeout: config.write_timeout,
        };
        let handle = SenderHandle {
            normal,
            high,
            connections: connections_tx,
        };
        (sender, handle)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    #[cfg(test)]
    pub(crate) fn drain_normal(&mut self) -> Vec<Message> {
        let mut drained = Vec::new();
        while let Ok(message) = self.normal.try_recv() {
            drained.push(message);
        }
        drained
    }

    fn install(&mut self, conn: Connection) {
        info!("Sender switched to {}", conn.peer());
        self.conn = Some(conn);
    }

    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Closed connection to {}", conn.peer());
        }
        if !self.router.try_signal(Signal::ResetConnection) {
            debug!("Router inbox is unavailable, reset not delivered");
        }
    }

    /// Encodes and writes one frame. Failures drop the message and the connection.
    async fn send(&mut self, message: Message) {
        if self.conn.is_none() {
            debug!("No active connection, {message} dropped");
            return;
        }

        self.buf.clear();
        let header = Header::new(&self.identity, message.context(), &self.ids);
        self.encoder.encode_header(&mut self.buf, &header);
        if let Err(e) = self.encoder.encode_message(&mut self.buf, &message) {
            warn!("Failed to encode {message}, message dropped: {e}");
            return;
        }
        let prefix = match length_prefix(self.buf.len()) {
            Ok(prefix) => prefix,
            Err(e) => {
                warn!("Failed to frame {message}, message dropped: {e}");
                return;
            }
        };

        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let deadline = Instant::now() + self.write_timeout;
        let written = timeout_at(deadline, conn.write_frame(&prefix, &self.buf)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Error occurred while writing data, connection has been dropped: {e}");
                self.drop_connection();
            }
            Err(_) => {
                warn!("Write deadline exceeded, connection has been dropped.");
                self.drop_connection();
            }
        }
    }
}

#[async_trait]
impl Task for Sender {
    fn name(&self) -> &'static str {
        "Sender"
    }

    async fn process(&mut self, inbox: &mut SignalInbox) -> Control {
        if self.conn.is_none() {
            return tokio::select! {
                signal = inbox.recv() => self.handle_signal(signal).await,
                conn = self.connections.recv() => match conn {
                    Some(conn) => {
                        self.install(conn);
                        Control::Continue
                    }
                    None => Control::Exit,
                },
            };
        }

        tokio::select! {
            signal = inbox.recv() => self.handle_signal(signal).await,
            Some(conn) = self.connections.recv() => {
                self.install(conn);
                Control::Continue
            }
            Some(message) = self.high.recv() => {
                self.send(message).await;
                Control::Continue
            }
            Some(message) = self.normal.recv() => {
                self.send(message).await;
                Control::Continue
            }
            else => Control::Exit,
        }
    }

    async fn before_stop(&mut self) {
        self.connections.close();
        self.high.close();
        self.normal.close();

        if self.conn.is_none() {
            if let Ok(conn) = self.connections.try_recv() {
                self.install(conn);
            }
        }

        let mut drained = 0usize;
        while let Some(message) = self.high.recv().await {
            self.send(message).await;
            drained += 1;
        }
        while let Some(message) = self.normal.recv().await {
            self.send(message).await;
            drained += 1;
        }
        debug!("Sender drained {drained} queued messages before stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{signal_channel, spawn};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tracing_test::traced_test;

    fn identity() -> Arc<Identity> {
        Arc::new(Identity {
            domain: "order-service".to_string(),
            env: "dev".to_string(),
            hostname: "box-1".to_string(),
            ip: "10.0.0.7".to_string(),
            ip_hex: "0a000007".to_string(),
        })
    }

    fn sender_with(config: &ClientConfig) -> (Sender, SenderHandle, SignalInbox) {
        let (router, router_inbox) = signal_channel();
        let identity = identity();
        let ids = Arc::new(MessageIdFactory::new(&identity.domain, &identity.ip_hex));
        let (sender, handle) = Sender::new(config, identity, ids, router);
        (sender, handle, router_inbox)
    }

    fn completed(status: &str) -> Transaction {
        let mut transaction = Transaction::new("URL", "/checkout", None);
        transaction.set_status(status);
        transaction.complete();
        transaction
    }

    fn small_queues(capacity: usize) -> ClientConfig {
        ClientConfig {
            normal_queue: QueueConfig {
                capacity,
                drop_policy: DropPolicy::Silent,
            },
            high_queue: QueueConfig {
                capacity,
                drop_policy: DropPolicy::Warn,
            },
            ..Default::default()
        }
    }

    async fn read_frame(reader: &mut DuplexStream) -> String {
        let len = reader.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await.unwrap();
        String::from_utf8(body).unwrap()
    }

    #[test]
    fn test_transaction_routed_by_status() {
        let (mut sender, handle, _router) = sender_with(&ClientConfig::default());

        assert!(handle.handle_transaction(completed("0")));
        assert!(handle.handle_transaction(completed("TimeoutException")));
        assert!(handle.handle_metric(Metric::new("Order", "count", None)));

        assert!(sender.normal.try_recv().unwrap().is_success());
        assert_eq!(sender.normal.try_recv().unwrap().kind(), "metric");
        assert_eq!(
            sender.high.try_recv().unwrap().status(),
            "TimeoutException"
        );
    }

    #[test]
    #[traced_test]
    fn test_full_high_queue_warns() {
        let (_sender, handle, _router) = sender_with(&small_queues(1));

        assert!(handle.handle_transaction(completed("500")));
        assert!(!handle.handle_transaction(completed("500")));
        assert!(logs_contain(
            "High priority channel is full, transaction URL//checkout has been discarded."
        ));
    }

    #[test]
    #[traced_test]
    fn test_full_normal_queue_is_silent() {
        let (_sender, handle, _router) = sender_with(&small_queues(1));

        assert!(handle.handle_event(Event::new("Cache", "hit", None)));
        assert!(!handle.handle_event(Event::new("Cache", "hit", None)));
        assert!(!logs_contain("priority channel is full"));
    }

    #[tokio::test]
    async fn test_send_writes_length_prefixed_frame() {
        let (mut sender, _handle, _router) = sender_with(&ClientConfig::default());
        let (writer, mut reader) = duplex(64 * 1024);
        sender.install(Connection::new("duplex", writer));

        sender.send(completed("0").into()).await;

        let body = read_frame(&mut reader).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("PT1\torder-service\tbox-1\t10.0.0.7\tcat\t0\tcat\torder-service-0a000007-"));
        assert!(lines[1].starts_with('A'));
        assert!(sender.is_connected());
    }

    #[tokio::test]
    async fn test_write_error_resets_connection() {
        let (mut sender, _handle, mut router) = sender_with(&ClientConfig::default());
        let (writer, reader) = duplex(1024);
        drop(reader);
        sender.install(Connection::new("duplex", writer));

        sender.send(completed("0").into()).await;

        assert!(!sender.is_connected());
        assert_eq!(router.try_recv(), Some(Signal::ResetConnection));
    }

    #[tokio::test]
    async fn test_write_deadline_resets_connection() {
        let config = ClientConfig {
            write_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (mut sender, _handle, mut router) = sender_with(&config);
        // nobody reads, so the frame cannot fit in the pipe
        let (writer, _reader) = duplex(8);
        sender.install(Connection::new("duplex", writer));

        sender.send(completed("0").into()).await;

        assert!(!sender.is_connected());
        assert_eq!(router.try_recv(), Some(Signal::ResetConnection));
    }

    #[tokio::test]
    async fn test_queued_messages_wait_for_connection() {
        let (sender, handle, _router) = sender_with(&ClientConfig::default());
        let (signals, inbox) = signal_channel();
        let task = spawn(sender, signals, inbox);

        assert!(handle.handle_transaction(completed("0")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (writer, mut reader) = duplex(64 * 1024);
        handle
            .connections()
            .send(Connection::new("duplex", writer))
            .await
            .unwrap();

        let body = read_frame(&mut reader).await;
        assert!(body.contains("\tURL\t/checkout\t0\t"));
        task.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_high_before_normal() {
        let (mut sender, handle, _router) = sender_with(&ClientConfig::default());

        for i in 0..3 {
            let mut normal = Transaction::new("URL", format!("n{i}"), None);
            normal.complete();
            assert!(handle.handle_transaction(normal));

            let mut high = Transaction::new("URL", format!("h{i}"), None);
            high.set_status("500");
            high.complete();
            assert!(handle.handle_transaction(high));
        }

        let (writer, mut reader) = duplex(64 * 1024);
        handle
            .connections()
            .send(Connection::new("duplex", writer))
            .await
            .unwrap();
        assert!(!sender.is_connected());

        sender.before_stop().await;

        let mut names = Vec::new();
        for _ in 0..6 {
            let body = read_frame(&mut reader).await;
            let line = body.lines().nth(1).unwrap();
            names.push(line.split('\t').nth(2).unwrap().to_string());
        }
        assert_eq!(names, vec!["h0", "h1", "h2", "n0", "n1", "n2"]);
    }
}
