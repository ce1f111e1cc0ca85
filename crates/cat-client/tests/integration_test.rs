// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use cat_client::{CatClient, ClientConfig, MessageFields, ServerAddress};
use mockito::{Matcher, Server, ServerGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn routing_api(body: String) -> (ServerGuard, mockito::Mock) {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/cat/s/router")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("domain".into(), "order-service".into()),
            Matcher::UrlEncoded("op".into(), "json".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect_at_least(1)
        .create_async()
        .await;
    (server, mock)
}

fn config_for(server: &ServerGuard) -> ClientConfig {
    let address = server.socket_address();
    ClientConfig {
        domain: "order-service".to_string(),
        hostname: Some("box-1".to_string()),
        ip: Some("127.0.0.1".parse().unwrap()),
        servers: vec![ServerAddress::new(
            address.ip().to_string(),
            0,
            address.port(),
        )],
        enable_monitor: false,
        ..Default::default()
    }
}

async fn read_frame(stream: &mut TcpStream) -> (u32, String) {
    let len = stream.read_u32().await.unwrap();
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.unwrap();
    (len, String::from_utf8(body).unwrap())
}

#[tokio::test]
async fn test_transaction_reaches_collector() {
    let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = collector.local_addr().unwrap().port();
    let (server, mock) = routing_api(format!(
        r#"{{"kvs":{{"routers":"127.0.0.1:{port};","sample":"1.0","block":"false"}}}}"#
    ))
    .await;

    let client = CatClient::start(config_for(&server)).await.unwrap();
    let (mut stream, _) = timeout(WAIT, collector.accept()).await.unwrap().unwrap();
    mock.assert_async().await;

    let mut transaction = client.new_transaction("URL", "/checkout");
    transaction.add_data("user", "42");
    transaction.log_event("Cache", "miss", "0", "key=cart");
    transaction.set_status("TimeoutException");
    transaction.complete();

    let (len, body) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
    assert_eq!(len as usize, body.len());

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("PT1\torder-service\tbox-1\t127.0.0.1\tcat\t0\tcat\torder-service-7f000001-"));
    assert!(lines[1].starts_with('t'));
    assert!(lines[1].ends_with("\tURL\t/checkout\t"));
    assert!(lines[2].starts_with('E'));
    assert!(lines[2].ends_with("\tCache\tmiss\t0\tkey=cart\t"));
    assert!(lines[3].starts_with('T'));
    assert!(lines[3].contains("\tURL\t/checkout\tTimeoutException\t"));
    assert!(lines[3].ends_with("us\tuser=42\t"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_block_discards_messages() {
    let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = collector.local_addr().unwrap().port();
    let (server, _mock) = routing_api(format!(
        r#"{{"kvs":{{"routers":"127.0.0.1:{port}","block":"true"}}}}"#
    ))
    .await;

    let client = CatClient::start(config_for(&server)).await.unwrap();
    let (mut stream, _) = timeout(WAIT, collector.accept()).await.unwrap().unwrap();
    assert!(!client.is_enabled());

    client.log_event("Cache", "miss", "0", "");

    let mut buf = [0u8; 4];
    let read = timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    assert!(read.is_err(), "no frame expected while traffic is blocked");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sample_rate_is_published() {
    let (server, mock) = routing_api(r#"{"kvs":{"sample":"0.25"}}"#.to_string()).await;

    let client = CatClient::start(config_for(&server)).await.unwrap();
    timeout(WAIT, async {
        while client.sample_rate() != 0.25 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    mock.assert_async().await;

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_queued_messages() {
    let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = collector.local_addr().unwrap().port();
    let (server, _mock) =
        routing_api(format!(r#"{{"kvs":{{"routers":"127.0.0.1:{port}"}}}}"#)).await;

    let client = CatClient::start(config_for(&server)).await.unwrap();
    let (mut stream, _) = timeout(WAIT, collector.accept()).await.unwrap().unwrap();

    for i in 0..3 {
        let mut metric = client.new_metric("Order", format!("placed-{i}"));
        metric.set_data("1");
        metric.complete();
    }
    client.shutdown().await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let (_, body) = timeout(WAIT, read_frame(&mut stream)).await.unwrap();
        let line = body.lines().nth(1).unwrap();
        names.push(line.split('\t').nth(2).unwrap().to_string());
    }
    assert_eq!(names, vec!["placed-0", "placed-1", "placed-2"]);
}
