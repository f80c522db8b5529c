//! Connection pool, bounded retries and the partition-leader metadata cache.

use super::{unexpected_response, Backoff, BrokerConnection};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::protocol::{ErrorCode, MetadataRequest, Request, Response};
use crate::types::TopicPartition;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Leaders of one topic's partitions as of `fetched_at`.
#[derive(Debug, Clone)]
struct CachedTopic {
    /// partition id -> leader broker id (-1 when leaderless).
    leaders: BTreeMap<i32, i32>,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct ClusterMetadata {
    /// broker id -> `host:port`.
    brokers: HashMap<i32, String>,
    topics: HashMap<String, CachedTopic>,
}

/// Owns one connection per broker endpoint and routes requests to leaders.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    connections: DashMap<String, Arc<BrokerConnection>>,
    /// Per-endpoint connect locks, so concurrent callers share one socket
    /// and a slow endpoint never holds up the others.
    connecting: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    metadata: RwLock<ClusterMetadata>,
    backoff: Backoff,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: Arc<ClientConfig>, metrics: Arc<ClientMetrics>) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
        );
        Self {
            config,
            connections: DashMap::new(),
            connecting: DashMap::new(),
            metadata: RwLock::new(ClusterMetadata::default()),
            backoff,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Live connection to `endpoint`, connecting if needed.
    pub async fn connection(&self, endpoint: &str) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        if let Some(conn) = self.live_connection(endpoint) {
            return Ok(conn);
        }
        let lock = Arc::clone(
            self.connecting
                .entry(endpoint.to_string())
                .or_default()
                .value(),
        );
        let _connecting = lock.lock().await;
        if let Some(conn) = self.live_connection(endpoint) {
            return Ok(conn);
        }
        let conn = BrokerConnection::connect(
            endpoint,
            &self.config.client_id,
            self.config.connect_timeout(),
            self.config.request_timeout(),
        )
        .await?;
        if self.is_closed() {
            conn.close().await;
            return Err(ClientError::Closed);
        }
        info!(endpoint, "connected to broker");
        self.connections
            .insert(endpoint.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    fn live_connection(&self, endpoint: &str) -> Option<Arc<BrokerConnection>> {
        let conn = self.connections.get(endpoint).map(|c| Arc::clone(c.value()))?;
        if conn.is_usable() {
            Some(conn)
        } else {
            self.connections.remove_if(endpoint, |_, c| !c.is_usable());
            None
        }
    }

    /// Send with the configured request timeout.
    pub async fn send(&self, endpoint: &str, request: &Request) -> Result<Response> {
        self.send_with_timeout(endpoint, request, self.config.request_timeout())
            .await
    }

    /// Send to one endpoint, reconnecting with backoff on connection errors.
    /// A top-level broker error response is returned as `ClientError::Broker`.
    pub async fn send_with_timeout(
        &self,
        endpoint: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let span = info_span!("request", endpoint, api_key = request.api_key());
        self.send_with_retries(endpoint, request, timeout)
            .instrument(span)
            .await
    }

    async fn send_with_retries(
        &self,
        endpoint: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            self.ensure_open()?;
            let result = match self.connection(endpoint).await {
                Ok(conn) => conn.send(request, timeout).await,
                Err(e) => Err(e),
            };
            self.metrics.record_request(result.is_ok());
            match result {
                Ok(Response::Error(e)) => {
                    return Err(ClientError::Broker {
                        code: e.code,
                        message: e.message,
                    })
                }
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    self.backoff_after(endpoint, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Write a request that expects no response (`acks=none` produce).
    pub async fn send_oneway(&self, endpoint: &str, request: &Request) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            self.ensure_open()?;
            let result = match self.connection(endpoint).await {
                Ok(conn) => conn.send_oneway(request).await,
                Err(e) => Err(e),
            };
            self.metrics.record_request(result.is_ok());
            match result {
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    self.backoff_after(endpoint, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Send to any reachable broker, cycling through known brokers and then
    /// the bootstrap endpoints.
    pub async fn send_any(&self, request: &Request) -> Result<Response> {
        let candidates = self.candidate_endpoints();
        if candidates.is_empty() {
            return Err(ClientError::Config("endpoint list is empty".into()));
        }
        let mut attempt = 0u32;
        loop {
            self.ensure_open()?;
            let endpoint = &candidates[attempt as usize % candidates.len()];
            let result = match self.connection(endpoint).await {
                Ok(conn) => conn.send(request, self.config.request_timeout()).await,
                Err(e) => Err(e),
            };
            self.metrics.record_request(result.is_ok());
            match result {
                Ok(Response::Error(e)) => {
                    return Err(ClientError::Broker {
                        code: e.code,
                        message: e.message,
                    })
                }
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    self.backoff_after(endpoint, attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn backoff_after(&self, endpoint: &str, attempt: u32, err: &ClientError) {
        self.connections.remove_if(endpoint, |_, c| !c.is_usable());
        let delay = self.backoff.delay(attempt);
        warn!(endpoint, attempt, ?delay, error = %err, "retrying after connection error");
        self.metrics.record_retry();
        tokio::time::sleep(delay).await;
    }

    fn candidate_endpoints(&self) -> Vec<String> {
        let mut candidates: Vec<String> = {
            let meta = self.metadata.read();
            let mut ids: Vec<_> = meta.brokers.keys().copied().collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| meta.brokers.get(&id).cloned())
                .collect()
        };
        for endpoint in &self.config.endpoints {
            if !candidates.contains(endpoint) {
                candidates.push(endpoint.clone());
            }
        }
        candidates
    }

    /// Fetch partition leaders for `topics` and replace their cache entries.
    pub async fn refresh_metadata(&self, topics: &[String]) -> Result<()> {
        let request = Request::Metadata(MetadataRequest {
            topics: topics.to_vec(),
        });
        let response = match self.send_any(&request).await? {
            Response::Metadata(m) => m,
            other => return Err(unexpected_response("metadata", &other)),
        };

        let mut failed = None;
        {
            let mut meta = self.metadata.write();
            for broker in &response.brokers {
                meta.brokers.insert(broker.node_id, broker.endpoint());
            }
            let now = Instant::now();
            for topic in response.topics {
                if topic.error.is_ok() {
                    let leaders = topic
                        .partitions
                        .iter()
                        .map(|p| (p.partition_id, p.leader_id))
                        .collect();
                    meta.topics.insert(
                        topic.name,
                        CachedTopic {
                            leaders,
                            fetched_at: now,
                        },
                    );
                } else {
                    meta.topics.remove(&topic.name);
                    if failed.is_none() && topics.contains(&topic.name) {
                        failed = Some((topic.name, topic.error));
                    }
                }
            }
        }
        debug!(?topics, brokers = response.brokers.len(), "metadata refreshed");

        match failed {
            None => Ok(()),
            Some((topic, code)) => code.check(&topic, -1),
        }
    }

    /// Drop the cached leaders of `topic`; the next lookup refreshes them.
    pub fn invalidate(&self, topic: &str) {
        self.metadata.write().topics.remove(topic);
    }

    fn cached_topic(&self, topic: &str) -> Option<CachedTopic> {
        let meta = self.metadata.read();
        meta.topics
            .get(topic)
            .filter(|t| t.fetched_at.elapsed() < self.config.metadata_max_age())
            .cloned()
    }

    async fn topic_metadata(&self, topic: &str) -> Result<CachedTopic> {
        if let Some(cached) = self.cached_topic(topic) {
            return Ok(cached);
        }
        self.refresh_metadata(&[topic.to_string()]).await?;
        self.cached_topic(topic)
            .ok_or_else(|| ClientError::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition: -1,
            })
    }

    /// Partition ids of `topic`, ascending.
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        Ok(self.topic_metadata(topic).await?.leaders.into_keys().collect())
    }

    pub async fn partition_count(&self, topic: &str) -> Result<i32> {
        Ok(self.topic_metadata(topic).await?.leaders.len() as i32)
    }

    /// Endpoint of the broker currently leading `tp`.
    pub async fn leader_endpoint(&self, tp: &TopicPartition) -> Result<String> {
        let cached = self.topic_metadata(&tp.topic).await?;
        let leader = *cached.leaders.get(&tp.partition).ok_or_else(|| {
            ClientError::UnknownTopicOrPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            }
        })?;
        if leader < 0 {
            return Err(ClientError::NotLeader {
                topic: tp.topic.clone(),
                partition: tp.partition,
            });
        }
        self.metadata
            .read()
            .brokers
            .get(&leader)
            .cloned()
            .ok_or_else(|| ClientError::NotLeader {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    /// Send to the leader of `tp`. When `extract` reports `NotLeader` the
    /// metadata is refreshed and the request retried once.
    pub async fn send_to_leader<T>(
        &self,
        tp: &TopicPartition,
        request: &Request,
        extract: impl Fn(Response) -> Result<T>,
    ) -> Result<T> {
        match self.try_leader(tp, request, &extract).await {
            Err(ClientError::NotLeader { .. }) => {
                info!(topic = %tp.topic, partition = tp.partition, "leader moved; refreshing metadata");
                self.invalidate(&tp.topic);
                self.refresh_metadata(&[tp.topic.clone()]).await?;
                self.try_leader(tp, request, &extract).await
            }
            other => other,
        }
    }

    async fn try_leader<T>(
        &self,
        tp: &TopicPartition,
        request: &Request,
        extract: &impl Fn(Response) -> Result<T>,
    ) -> Result<T> {
        let endpoint = self.leader_endpoint(tp).await?;
        match self.send(&endpoint, request).await {
            Ok(response) => extract(response),
            Err(ClientError::Broker {
                code: ErrorCode::NotLeaderForPartition,
                ..
            }) => Err(ClientError::NotLeader {
                topic: tp.topic.clone(),
                partition: tp.partition,
            }),
            Err(e) => Err(e),
        }
    }

    /// Close every connection; pending and later calls fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Arc<BrokerConnection>> = self
            .connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        self.connections.clear();
        for conn in connections {
            conn.close().await;
        }
        debug!("connection manager closed");
    }
}
