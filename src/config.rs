//! Client configuration: one explicit struct, validated at construction.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Durability level the producer requests for each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget; the broker sends no response.
    None,
    /// Resolve once the partition leader has persisted the batch.
    #[default]
    Leader,
    /// Resolve once the leader and the replica quorum have persisted the batch.
    All,
}

impl Acks {
    /// Wire value (Kafka convention).
    pub fn as_wire(self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }

    pub fn from_wire(value: i16) -> Option<Self> {
        match value {
            0 => Some(Acks::None),
            1 => Some(Acks::Leader),
            -1 => Some(Acks::All),
            _ => None,
        }
    }
}

impl std::str::FromStr for Acks {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Acks::None),
            "leader" | "1" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            other => Err(ClientError::Config(format!("unknown acks value '{}'", other))),
        }
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
}

/// Configuration shared by the producer and consumer cores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Bootstrap endpoints (`host:port`).
    pub endpoints: Vec<String>,
    pub client_id: String,
    pub acks: Acks,
    /// How long a partial batch may wait for more records.
    pub linger_ms: u64,
    pub batch_max_bytes: usize,
    pub batch_max_records: usize,
    /// Consumer group; required for offset commits.
    pub group_id: Option<String>,
    pub auto_offset_reset: AutoOffsetReset,
    pub enable_auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound for `flush()` and for a single delivery.
    pub delivery_timeout_ms: u64,
    pub max_retries: u32,
    /// Backoff base for reconnects.
    pub retry_backoff_ms: u64,
    /// Backoff cap for reconnects.
    pub retry_backoff_max_ms: u64,
    pub metadata_max_age_ms: u64,
    /// Per-partition fetch budget.
    pub fetch_max_bytes: u32,
    /// Idle time after which iteration helpers stop waiting for records.
    pub consumer_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:9092".to_string()],
            client_id: "thorstream-client".to_string(),
            acks: Acks::Leader,
            linger_ms: 5,
            batch_max_bytes: 16 * 1024,
            batch_max_records: 500,
            group_id: None,
            auto_offset_reset: AutoOffsetReset::Latest,
            enable_auto_commit: false,
            auto_commit_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            delivery_timeout_ms: 120_000,
            max_retries: 5,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 5_000,
            metadata_max_age_ms: 300_000,
            fetch_max_bytes: 1024 * 1024,
            consumer_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Load a JSON config file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Defaults overridden by `THORSTREAM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("THORSTREAM_BOOTSTRAP_SERVERS") {
            config.endpoints = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(client_id) = std::env::var("THORSTREAM_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(acks) = std::env::var("THORSTREAM_ACKS") {
            config.acks = acks.parse()?;
        }
        if let Ok(group_id) = std::env::var("THORSTREAM_GROUP_ID") {
            config.group_id = Some(group_id);
        }
        if let Ok(linger) = std::env::var("THORSTREAM_LINGER_MS") {
            config.linger_ms = linger.parse().map_err(|_| {
                ClientError::Config(format!("invalid THORSTREAM_LINGER_MS '{}'", linger))
            })?;
        }
        Ok(config)
    }

    /// Reject configurations that would only fail on first use.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ClientError::Config("endpoint list is empty".into()));
        }
        for endpoint in &self.endpoints {
            let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
                ClientError::Config(format!("endpoint '{}' is not host:port", endpoint))
            })?;
            if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
                return Err(ClientError::Config(format!(
                    "endpoint '{}' is not host:port",
                    endpoint
                )));
            }
        }
        let timeouts = [
            ("requestTimeoutMs", self.request_timeout_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("deliveryTimeoutMs", self.delivery_timeout_ms),
            ("metadataMaxAgeMs", self.metadata_max_age_ms),
            ("autoCommitIntervalMs", self.auto_commit_interval_ms),
            ("retryBackoffMs", self.retry_backoff_ms),
            ("consumerTimeoutMs", self.consumer_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be positive", name)));
            }
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(ClientError::Config(
                "retryBackoffMaxMs must not be below retryBackoffMs".into(),
            ));
        }
        if self.batch_max_bytes == 0 || self.batch_max_records == 0 {
            return Err(ClientError::Config("batch limits must be positive".into()));
        }
        if self.fetch_max_bytes == 0 {
            return Err(ClientError::Config("fetchMaxBytes must be positive".into()));
        }
        if matches!(&self.group_id, Some(g) if g.trim().is_empty()) {
            return Err(ClientError::Config("groupId must not be blank".into()));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_millis(self.metadata_max_age_ms)
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_timeout_ms)
    }
}
