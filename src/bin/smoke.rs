//! Produce/consume smoke test against a running cluster.
//!
//! Reads the client configuration from the environment
//! (THORSTREAM_BOOTSTRAP_SERVERS etc.). THORSTREAM_TOPIC and
//! THORSTREAM_GROUP_ID select the topic and group; both default to fresh
//! timestamp-suffixed names so repeated runs do not see each other's data.
//! THORSTREAM_SMOKE_COUNT sets the number of messages (default 3).

use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use thorstream_client::{AutoOffsetReset, Client, ClientConfig, Record};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("thorstream_client=info".parse()?),
        )
        .init();

    let started = unix_secs();
    let topic = std::env::var("THORSTREAM_TOPIC").unwrap_or_else(|_| format!("test-{}", started));
    let count: usize = std::env::var("THORSTREAM_SMOKE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let mut config = ClientConfig::from_env()?;
    if config.group_id.is_none() {
        config.group_id = Some(format!("test-group-{}", started));
    }
    config.auto_offset_reset = AutoOffsetReset::Earliest;
    config.enable_auto_commit = false;
    config.consumer_timeout_ms = 5_000;
    let client = Client::new(config)?;
    info!(endpoints = ?client.config().endpoints, %topic, "starting smoke test");

    println!("Producing {} messages to {}...", count, topic);
    let producer = client.producer();
    for i in 0..count {
        let message = json!({
            "id": i,
            "timestamp": unix_millis(),
            "message": format!("Test message {}", i),
        });
        let metadata = producer
            .send_and_wait(Record::new(topic.as_str(), serde_json::to_vec(&message)?))
            .await?;
        println!(
            "Sent message {} -> partition {}, offset {:?}",
            i, metadata.partition, metadata.offset
        );
    }
    producer.flush().await?;
    producer.close().await?;
    println!("Producer finished.");

    println!("Consuming messages...");
    let mut consumer = client.consumer();
    consumer.subscribe(&[topic.as_str()]).await?;
    let mut received = 0;
    'consume: loop {
        let records = consumer.consume().await?;
        if records.is_empty() {
            break;
        }
        for record in records {
            let value: serde_json::Value = serde_json::from_slice(&record.value)?;
            received += 1;
            println!(
                "Received: {} (partition {}, offset {})",
                value["message"].as_str().unwrap_or("<no message>"),
                record.partition,
                record.offset
            );
            if received >= count {
                break 'consume;
            }
        }
    }
    consumer.close().await?;

    println!("Consumed {} of {} messages.", received, count);
    if received < count {
        anyhow::bail!("expected {} messages, received {}", count, received);
    }
    info!(
        metrics = %producer.metrics().render_prometheus(&client.config().client_id),
        "smoke test passed"
    );
    Ok(())
}
