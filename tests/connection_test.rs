//! Connection layer: correlation, timeouts, retries and the metadata cache.

mod common;

use common::MockBroker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thorstream_client::connection::{Backoff, BrokerConnection, ConnectionManager};
use thorstream_client::protocol::{
    BatchRecord, FetchPartition, FetchRequest, MetadataRequest, ProduceRequest, Request, Response,
};
use thorstream_client::{ClientConfig, ClientError, ClientMetrics, TopicPartition};

fn fetch(topic: &str, partition: i32, max_wait_ms: u32) -> Request {
    Request::Fetch(FetchRequest {
        max_wait_ms,
        min_bytes: 1,
        partitions: vec![FetchPartition {
            topic: topic.into(),
            partition,
            offset: 0,
            max_bytes: 1024,
        }],
    })
}

fn metadata() -> Request {
    Request::Metadata(MetadataRequest { topics: vec![] })
}

fn manager(config: ClientConfig) -> (ConnectionManager, Arc<ClientMetrics>) {
    let metrics = Arc::new(ClientMetrics::new());
    (
        ConnectionManager::new(Arc::new(config), Arc::clone(&metrics)),
        metrics,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_resolve_by_correlation_id() {
    let broker = MockBroker::start().await;
    broker.create_topic("t", 16);
    let conn = BrokerConnection::connect(
        &broker.endpoint(),
        "test",
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    // Earlier requests wait longer, so responses come back out of order.
    let mut tasks = Vec::new();
    for partition in 0..16 {
        let conn = Arc::clone(&conn);
        let request = fetch("t", partition, (16 - partition as u32) * 15);
        tasks.push(tokio::spawn(async move {
            let response = conn.send(&request, Duration::from_secs(2)).await.unwrap();
            (partition, response)
        }));
    }
    for task in tasks {
        let (partition, response) = task.await.unwrap();
        match response {
            Response::Fetch(f) => {
                assert_eq!(f.partitions.len(), 1);
                assert_eq!(f.partitions[0].partition, partition);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}

#[tokio::test]
async fn silent_broker_surfaces_timeout() {
    let broker = MockBroker::start().await;
    let conn = BrokerConnection::connect(
        &broker.endpoint(),
        "test",
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    broker.set_silent(true);

    let err = conn
        .send(
            &metadata(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "got {:?}", err);
    assert!(conn.is_usable());
}

#[tokio::test]
async fn close_fails_in_flight_requests_with_closed() {
    let broker = MockBroker::start().await;
    broker.create_topic("t", 1);
    let conn = BrokerConnection::connect(
        &broker.endpoint(),
        "test",
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let waiting = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.send(&fetch("t", 0, 2_000), Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ClientError::Closed)));
    assert!(!conn.is_usable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_send_keeps_frames_aligned() {
    let broker = MockBroker::start().await;
    let conn = BrokerConnection::connect(
        &broker.endpoint(),
        "test",
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let large = Request::Produce(ProduceRequest {
        acks: 1,
        timeout_ms: 1_000,
        topic: "large".into(),
        partition: 0,
        records: vec![BatchRecord {
            key: None,
            value: vec![7u8; 8 * 1024 * 1024],
            headers: Vec::new(),
            timestamp: 0,
        }],
    });
    // Give up on the request while its frame is still being written.
    let _ = tokio::time::timeout(
        Duration::from_millis(1),
        conn.send(&large, Duration::from_secs(5)),
    )
    .await;

    let response = conn.send(&metadata(), Duration::from_secs(5)).await.unwrap();
    assert!(matches!(response, Response::Metadata(_)), "got {:?}", response);
    assert!(conn.is_usable());
}

#[tokio::test]
async fn dropped_connection_reconnects_with_backoff() {
    let broker = MockBroker::start().await;
    let (manager, metrics) = manager(ClientConfig {
        max_retries: 5,
        ..broker.config()
    });
    manager.partitions("t").await.unwrap();
    assert_eq!(broker.connections(), 1);

    broker.refuse_connections(2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = manager.send(&broker.endpoint(), &metadata()).await.unwrap();
    assert!(matches!(response, Response::Metadata(_)));
    assert_eq!(broker.connections(), 2);
    assert!(metrics.snapshot().retries >= 2);
}

#[tokio::test]
async fn stalled_endpoint_does_not_block_other_connects() {
    let broker = MockBroker::start().await;
    // Accepted by the kernel backlog but never served, so the handshake hangs.
    let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_endpoint = stalled.local_addr().unwrap().to_string();
    let (manager, _) = manager(ClientConfig {
        request_timeout_ms: 3_000,
        max_retries: 0,
        ..broker.config()
    });
    let manager = Arc::new(manager);

    let hanging = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.send(&stalled_endpoint, &metadata()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    manager.send(&broker.endpoint(), &metadata()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    let err = hanging.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "got {:?}", err);
    drop(stalled);
}

#[tokio::test]
async fn unreachable_endpoint_fails_after_bounded_retries() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let (manager, metrics) = manager(ClientConfig {
        endpoints: vec![endpoint],
        max_retries: 2,
        retry_backoff_ms: 5,
        retry_backoff_max_ms: 20,
        connect_timeout_ms: 500,
        ..ClientConfig::default()
    });
    let err = manager
        .send_any(&metadata())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)), "got {:?}", err);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.requests, 3);
    assert_eq!(snapshot.request_errors, 3);
}

#[tokio::test]
async fn metadata_is_cached_until_invalidated() {
    let broker = MockBroker::with_partitions(3).await;
    let (manager, _) = manager(broker.config());

    assert_eq!(manager.partitions("orders").await.unwrap(), vec![0, 1, 2]);
    assert_eq!(manager.partition_count("orders").await.unwrap(), 3);
    assert_eq!(broker.metadata_requests(), 1);

    let tp = TopicPartition::new("orders", 1);
    assert_eq!(manager.leader_endpoint(&tp).await.unwrap(), broker.endpoint());
    assert_eq!(broker.metadata_requests(), 1);

    manager.invalidate("orders");
    manager.partitions("orders").await.unwrap();
    assert_eq!(broker.metadata_requests(), 2);
}

#[tokio::test]
async fn unknown_partition_has_no_leader() {
    let broker = MockBroker::with_partitions(2).await;
    let (manager, _) = manager(broker.config());
    let err = manager
        .leader_endpoint(&TopicPartition::new("orders", 7))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::UnknownTopicOrPartition { partition: 7, .. }
    ));
}

#[tokio::test]
async fn closed_manager_rejects_requests() {
    let broker = MockBroker::start().await;
    let (manager, _) = manager(broker.config());
    manager.partitions("t").await.unwrap();
    manager.close().await;
    manager.close().await;
    assert!(manager.is_closed());

    let err = manager
        .send(
            &broker.endpoint(),
            &metadata(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Closed));
}

#[test]
fn backoff_is_capped_with_full_jitter() {
    let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
    assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
    assert_eq!(backoff.ceiling(3), Duration::from_millis(800));
    assert_eq!(backoff.ceiling(10), Duration::from_secs(5));
    assert_eq!(backoff.ceiling(64), Duration::from_secs(5));
    for attempt in 0..8 {
        for _ in 0..50 {
            assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
        }
    }
}
