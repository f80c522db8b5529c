//! Client facade: configuration loading, validation and an end-to-end run.

mod common;

use common::MockBroker;
use std::io::Write;
use thorstream_client::{
    Acks, AutoOffsetReset, Client, ClientConfig, ClientError, Record, TopicPartition,
};

fn config_error(config: ClientConfig) -> bool {
    matches!(Client::new(config), Err(ClientError::Config(_)))
}

#[test]
fn default_config_is_valid() {
    let config = ClientConfig::default();
    config.validate().unwrap();
    assert_eq!(config.acks, Acks::Leader);
    assert_eq!(config.auto_offset_reset, AutoOffsetReset::Latest);
    assert!(!config.enable_auto_commit);
}

#[test]
fn invalid_configs_fail_at_construction() {
    assert!(config_error(ClientConfig {
        endpoints: vec![],
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        endpoints: vec!["localhost".into()],
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        endpoints: vec!["localhost:0".into()],
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        endpoints: vec![":9092".into()],
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        request_timeout_ms: 0,
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        connect_timeout_ms: 0,
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        consumer_timeout_ms: 0,
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        retry_backoff_ms: 200,
        retry_backoff_max_ms: 100,
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        batch_max_records: 0,
        ..ClientConfig::default()
    }));
    assert!(config_error(ClientConfig {
        group_id: Some("  ".into()),
        ..ClientConfig::default()
    }));
}

#[test]
fn json_config_uses_camel_case_and_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "endpoints": ["localhost:9092", "localhost:9192", "localhost:9292"],
            "acks": "all",
            "lingerMs": 20,
            "batchMaxBytes": 4096,
            "groupId": "test-group",
            "autoOffsetReset": "earliest",
            "enableAutoCommit": true
        }}"#
    )
    .unwrap();

    let client = Client::from_json_file(file.path()).unwrap();
    let config = client.config();
    assert_eq!(config.endpoints.len(), 3);
    assert_eq!(config.acks, Acks::All);
    assert_eq!(config.linger_ms, 20);
    assert_eq!(config.batch_max_bytes, 4096);
    assert_eq!(config.group_id.as_deref(), Some("test-group"));
    assert_eq!(config.auto_offset_reset, AutoOffsetReset::Earliest);
    assert!(config.enable_auto_commit);
    assert_eq!(config.request_timeout_ms, ClientConfig::default().request_timeout_ms);
}

#[test]
fn json_config_errors_are_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "acks": "sometimes" }}"#).unwrap();
    assert!(matches!(
        ClientConfig::from_json_file(file.path()),
        Err(ClientError::Config(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ClientConfig::from_json_file(dir.path().join("missing.json")),
        Err(ClientError::Io(_))
    ));
}

#[test]
fn env_overrides_defaults() {
    std::env::set_var("THORSTREAM_BOOTSTRAP_SERVERS", "a:1, b:2,");
    std::env::set_var("THORSTREAM_ACKS", "none");
    std::env::set_var("THORSTREAM_GROUP_ID", "env-group");
    std::env::set_var("THORSTREAM_LINGER_MS", "7");
    let config = ClientConfig::from_env().unwrap();
    assert_eq!(config.endpoints, vec!["a:1".to_string(), "b:2".to_string()]);
    assert_eq!(config.acks, Acks::None);
    assert_eq!(config.group_id.as_deref(), Some("env-group"));
    assert_eq!(config.linger_ms, 7);

    std::env::set_var("THORSTREAM_ACKS", "most");
    assert!(matches!(ClientConfig::from_env(), Err(ClientError::Config(_))));
    for var in [
        "THORSTREAM_BOOTSTRAP_SERVERS",
        "THORSTREAM_ACKS",
        "THORSTREAM_GROUP_ID",
        "THORSTREAM_LINGER_MS",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
fn acks_parse_and_wire_values() {
    for (text, acks, wire) in [
        ("none", Acks::None, 0),
        ("leader", Acks::Leader, 1),
        ("ALL", Acks::All, -1),
    ] {
        let parsed: Acks = text.parse().unwrap();
        assert_eq!(parsed, acks);
        assert_eq!(parsed.as_wire(), wire);
        assert_eq!(Acks::from_wire(wire), Some(acks));
    }
    assert_eq!(Acks::from_wire(2), None);
}

#[tokio::test]
async fn produce_then_consume_through_one_client() {
    let broker = MockBroker::start().await;
    let client = Client::new(ClientConfig {
        acks: Acks::All,
        auto_offset_reset: AutoOffsetReset::Earliest,
        group_id: Some("e2e-group".into()),
        consumer_timeout_ms: 1_000,
        ..broker.config()
    })
    .unwrap();

    let producer = client.producer();
    for i in 0..3 {
        let message = serde_json::json!({ "id": i, "message": format!("Test message {}", i) });
        let metadata = producer
            .send_and_wait(Record::new("e2e", serde_json::to_vec(&message).unwrap()))
            .await
            .unwrap();
        assert_eq!(metadata.offset, Some(i));
    }
    producer.flush().await.unwrap();
    producer.close().await.unwrap();

    let mut consumer = client.consumer();
    consumer.subscribe(&["e2e"]).await.unwrap();
    let mut messages = Vec::new();
    loop {
        let records = consumer.consume().await.unwrap();
        if records.is_empty() {
            break;
        }
        for record in records {
            let value: serde_json::Value = serde_json::from_slice(&record.value).unwrap();
            messages.push(value["message"].as_str().unwrap().to_string());
        }
        if messages.len() >= 3 {
            break;
        }
    }
    assert_eq!(
        messages,
        vec!["Test message 0", "Test message 1", "Test message 2"]
    );

    consumer.commit().await.unwrap();
    assert_eq!(broker.committed("e2e-group", &TopicPartition::new("e2e", 0)), Some(2));
    consumer.close().await.unwrap();

    let metrics = producer.metrics().render_prometheus("test-client");
    assert!(metrics.contains("thorstream_client_records_acked_total{client_id=\"test-client\"} 3"));
}
