//! Thorstream client: asynchronous producer and consumer cores for
//! partitioned, append-only Thorstream brokers.

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod observability;
pub mod producer;
pub mod protocol;
pub mod types;

pub use client::Client;
pub use config::{Acks, AutoOffsetReset, ClientConfig};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerRecords, PartitionState};
pub use error::{ClientError, Result};
pub use observability::{ClientMetrics, MetricsSnapshot};
pub use producer::{DeliveryFuture, Producer};
pub use types::{ConsumerRecord, Record, RecordHeader, RecordMetadata, TopicPartition};
