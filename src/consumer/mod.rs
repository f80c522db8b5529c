//! Consumer: assign partitions, poll records, commit offsets.
//!
//! Delivery is at-least-once. The committed offset of a partition is the last
//! offset the application processed; a consumer joining the group resumes at
//! `committed + 1`.

mod records;
mod state;

pub use records::ConsumerRecords;
pub use state::PartitionState;

use crate::config::{AutoOffsetReset, ClientConfig};
use crate::connection::{unexpected_response, ConnectionManager};
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::protocol::{
    CommitOffset, ErrorCode, FetchPartition, FetchPartitionResponse, FetchRequest,
    ListOffsetsPartition, ListOffsetsRequest, OffsetCommitRequest, OffsetFetchRequest, OffsetSpec,
    Request, Response,
};
use crate::types::{ConsumerRecord, TopicPartition};
use state::PartitionCursor;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct Consumer {
    config: Arc<ClientConfig>,
    manager: Arc<ConnectionManager>,
    metrics: Arc<ClientMetrics>,
    /// Ordered by topic, then partition.
    cursors: BTreeMap<TopicPartition, PartitionCursor>,
    subscription: Vec<String>,
    generation_id: i32,
    member_id: String,
    last_auto_commit: Instant,
    closed: bool,
}

impl Consumer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(Arc::new(config)))
    }

    pub(crate) fn with_config(config: Arc<ClientConfig>) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        Self {
            config,
            manager,
            metrics,
            cursors: BTreeMap::new(),
            subscription: Vec::new(),
            generation_id: -1,
            member_id: String::new(),
            last_auto_commit: Instant::now(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Assign every partition of `topics`.
    pub async fn subscribe<S: AsRef<str>>(&mut self, topics: &[S]) -> Result<()> {
        self.ensure_open()?;
        let mut partitions = Vec::new();
        for topic in topics {
            let topic = topic.as_ref();
            for partition in self.manager.partitions(topic).await? {
                partitions.push(TopicPartition::new(topic, partition));
            }
        }
        self.assign(partitions).await?;
        self.subscription = topics.iter().map(|t| t.as_ref().to_string()).collect();
        Ok(())
    }

    pub fn subscription(&self) -> &[String] {
        &self.subscription
    }

    /// Replace the assignment. Partitions kept from the previous assignment
    /// keep their cursor; new ones start after the group's committed offset,
    /// or per `autoOffsetReset` when nothing is committed.
    pub async fn assign(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.ensure_open()?;
        for tp in &partitions {
            if !self.manager.partitions(&tp.topic).await?.contains(&tp.partition) {
                return Err(ClientError::UnknownTopicOrPartition {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                });
            }
        }

        let mut fresh: Vec<TopicPartition> = partitions
            .iter()
            .filter(|tp| !self.cursors.contains_key(*tp))
            .cloned()
            .collect();
        fresh.sort();
        fresh.dedup();
        let committed = self.fetch_committed(&fresh).await?;
        let reset = self.reset_spec();

        let mut cursors = BTreeMap::new();
        for tp in partitions {
            if let Some(cursor) = self.cursors.remove(&tp) {
                cursors.insert(tp, cursor);
            }
        }
        for tp in fresh {
            let last_committed = committed.get(&tp).copied().flatten();
            let position = match last_committed {
                Some(offset) => offset + 1,
                None => self.list_offset(&tp, reset).await?,
            };
            debug!(%tp, position, ?last_committed, "partition assigned");
            cursors.insert(tp, PartitionCursor::new(position, last_committed));
        }
        self.cursors = cursors;
        self.subscription.clear();
        info!(partitions = self.cursors.len(), "assignment updated");
        Ok(())
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.cursors.keys().cloned().collect()
    }

    /// Fetch from every assigned partition, waiting up to `max_wait` for at
    /// least one record. An empty result means no new data.
    pub async fn poll(&mut self, max_wait: Duration) -> Result<ConsumerRecords> {
        self.ensure_open()?;
        for cursor in self.cursors.values_mut() {
            if cursor.state == PartitionState::Delivering {
                cursor.state = PartitionState::Fetching;
            }
        }
        self.maybe_auto_commit().await;

        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self
                .cursors
                .values()
                .any(|c| c.state == PartitionState::Fetching)
            {
                tokio::time::sleep(remaining).await;
                return Ok(ConsumerRecords::empty());
            }
            let records = self.fetch_round(remaining).await?;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(ConsumerRecords::new(records));
            }
        }
    }

    /// Poll with `consumerTimeoutMs` as the wait.
    pub async fn consume(&mut self) -> Result<ConsumerRecords> {
        let timeout = self.config.consumer_timeout();
        self.poll(timeout).await
    }

    async fn fetch_round(&mut self, remaining: Duration) -> Result<Vec<ConsumerRecord>> {
        let fetching: Vec<(TopicPartition, i64)> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.state == PartitionState::Fetching)
            .map(|(tp, c)| (tp.clone(), c.position))
            .collect();

        let mut by_leader: HashMap<String, Vec<FetchPartition>> = HashMap::new();
        for (tp, position) in fetching {
            match self.manager.leader_endpoint(&tp).await {
                Ok(endpoint) => by_leader.entry(endpoint).or_default().push(FetchPartition {
                    topic: tp.topic,
                    partition: tp.partition,
                    offset: position,
                    max_bytes: self.config.fetch_max_bytes,
                }),
                Err(ClientError::NotLeader { .. }) => {
                    debug!(%tp, "no leader; skipping this round");
                    self.manager.invalidate(&tp.topic);
                }
                Err(e) => return Err(e),
            }
        }
        if by_leader.is_empty() {
            let pause = Duration::from_millis(self.config.retry_backoff_ms).min(remaining);
            tokio::time::sleep(pause).await;
            return Ok(Vec::new());
        }

        let max_wait_ms = remaining.as_millis().min(u32::MAX as u128) as u32;
        let timeout = self.config.request_timeout() + remaining;
        let mut fetches = JoinSet::new();
        for (endpoint, partitions) in by_leader {
            let manager = Arc::clone(&self.manager);
            let topics: Vec<String> = partitions.iter().map(|p| p.topic.clone()).collect();
            let request = Request::Fetch(FetchRequest {
                max_wait_ms,
                min_bytes: 1,
                partitions,
            });
            fetches.spawn(async move {
                let result = manager
                    .send_with_timeout(&endpoint, &request, timeout)
                    .await;
                (topics, result)
            });
        }

        let mut responses = Vec::new();
        let mut failure = None;
        while let Some(joined) = fetches.join_next().await {
            let (topics, result) = joined
                .map_err(|e| ClientError::Connection(format!("fetch task failed: {}", e)))?;
            match result {
                Ok(Response::Fetch(fetched)) => responses.extend(fetched.partitions),
                Ok(other) => {
                    failure.get_or_insert(unexpected_response("fetch", &other));
                }
                Err(ClientError::Broker {
                    code: ErrorCode::NotLeaderForPartition,
                    ..
                }) => {
                    for topic in &topics {
                        self.manager.invalidate(topic);
                    }
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        // Cursors only move for applied responses, so dropping the rest
        // just refetches them.
        if let Some(e) = failure {
            return Err(e);
        }

        // Settle every error before any cursor moves.
        let mut ready = Vec::new();
        let mut out_of_range = Vec::new();
        for fetched in responses {
            let tp = TopicPartition::new(fetched.topic.clone(), fetched.partition);
            match fetched.error {
                ErrorCode::None => ready.push((tp, fetched)),
                ErrorCode::OffsetOutOfRange => out_of_range.push(tp),
                ErrorCode::NotLeaderForPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::UnknownTopicOrPartition => {
                    debug!(%tp, code = ?fetched.error, "fetch rejected; refreshing metadata");
                    self.manager.invalidate(&tp.topic);
                }
                code => code.check(&tp.topic, tp.partition)?,
            }
        }
        for tp in out_of_range {
            self.reset_position(&tp).await?;
        }

        let mut records = Vec::new();
        for (tp, fetched) in ready {
            self.apply_fetch(tp, fetched, &mut records);
        }
        Ok(records)
    }

    fn apply_fetch(
        &mut self,
        tp: TopicPartition,
        fetched: FetchPartitionResponse,
        out: &mut Vec<ConsumerRecord>,
    ) {
        let Some(cursor) = self.cursors.get_mut(&tp) else {
            return;
        };
        if cursor.state != PartitionState::Fetching {
            return;
        }
        let mut delivered = 0;
        let mut bytes = 0;
        for stored in fetched.records {
            if !cursor.advance(stored.offset) {
                continue;
            }
            delivered += 1;
            bytes += stored.value.len() + stored.key.as_ref().map(|k| k.len()).unwrap_or(0);
            out.push(ConsumerRecord {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: stored.offset,
                key: stored.key,
                value: stored.value,
                headers: stored.headers,
                timestamp: stored.timestamp,
            });
        }
        if delivered > 0 {
            cursor.state = PartitionState::Delivering;
            self.metrics.record_fetch(delivered, bytes);
        }
    }

    async fn reset_position(&mut self, tp: &TopicPartition) -> Result<()> {
        let offset = self.list_offset(tp, self.reset_spec()).await?;
        if let Some(cursor) = self.cursors.get_mut(tp) {
            warn!(%tp, from = cursor.position, to = offset, "offset out of range; resetting");
            cursor.position = offset;
        }
        Ok(())
    }

    fn reset_spec(&self) -> OffsetSpec {
        match self.config.auto_offset_reset {
            AutoOffsetReset::Earliest => OffsetSpec::Earliest,
            AutoOffsetReset::Latest => OffsetSpec::Latest,
        }
    }

    async fn list_offset(&self, tp: &TopicPartition, spec: OffsetSpec) -> Result<i64> {
        let request = Request::ListOffsets(ListOffsetsRequest {
            partitions: vec![ListOffsetsPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
                spec,
            }],
        });
        self.manager
            .send_to_leader(tp, &request, |response| match response {
                Response::ListOffsets(listed) => {
                    let found = listed
                        .partitions
                        .into_iter()
                        .find(|p| p.topic == tp.topic && p.partition == tp.partition)
                        .ok_or_else(|| {
                            ClientError::MalformedFrame(format!(
                                "list_offsets response has no entry for {}",
                                tp
                            ))
                        })?;
                    found.error.check(&tp.topic, tp.partition)?;
                    Ok(found.offset)
                }
                other => Err(unexpected_response("list_offsets", &other)),
            })
            .await
    }

    async fn fetch_committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        let group_id = match &self.config.group_id {
            Some(group_id) if !partitions.is_empty() => group_id.clone(),
            _ => return Ok(HashMap::new()),
        };
        let request = Request::OffsetFetch(OffsetFetchRequest {
            group_id,
            partitions: partitions.to_vec(),
        });
        let fetched = match self.manager.send_any(&request).await? {
            Response::OffsetFetch(fetched) => fetched,
            other => return Err(unexpected_response("offset_fetch", &other)),
        };
        let mut committed = HashMap::new();
        for entry in fetched.partitions {
            entry.error.check(&entry.topic, entry.partition)?;
            committed.insert(TopicPartition::new(entry.topic, entry.partition), entry.offset);
        }
        Ok(committed)
    }

    /// Commit the last delivered offset of every partition that delivered
    /// records since assignment or its last seek. Partitions whose delivered
    /// offset is already committed are skipped.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let offsets: HashMap<TopicPartition, i64> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.last_delivered != c.committed)
            .filter_map(|(tp, c)| c.last_delivered.map(|offset| (tp.clone(), offset)))
            .collect();
        if offsets.is_empty() {
            return Ok(());
        }
        self.commit_offsets(offsets).await
    }

    /// Commit explicit offsets, each the last processed offset of its
    /// partition. Broker rejection (for example a stale generation) fails
    /// with `Commit`; the caller decides whether to retry.
    pub async fn commit_offsets(&mut self, offsets: HashMap<TopicPartition, i64>) -> Result<()> {
        self.ensure_open()?;
        let group_id = self
            .config
            .group_id
            .clone()
            .ok_or_else(|| ClientError::Config("groupId is required to commit offsets".into()))?;
        if offsets.is_empty() {
            return Ok(());
        }

        for tp in offsets.keys() {
            if let Some(cursor) = self.cursors.get_mut(tp) {
                cursor.state = PartitionState::Committing;
            }
        }
        let mut entries: Vec<CommitOffset> = offsets
            .iter()
            .map(|(tp, offset)| CommitOffset {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *offset,
            })
            .collect();
        entries.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        let request = Request::OffsetCommit(OffsetCommitRequest {
            group_id,
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
            offsets: entries,
        });
        let result = self.send_commit(&request).await;

        for (tp, offset) in &offsets {
            if let Some(cursor) = self.cursors.get_mut(tp) {
                cursor.state = PartitionState::Fetching;
                if result.is_ok() {
                    cursor.committed = Some(*offset);
                }
            }
        }
        if result.is_ok() {
            self.metrics.record_commit();
            debug!(partitions = offsets.len(), "offsets committed");
        }
        result
    }

    async fn send_commit(&self, request: &Request) -> Result<()> {
        let response = match self.manager.send_any(request).await {
            Ok(Response::OffsetCommit(response)) => response,
            Ok(other) => return Err(unexpected_response("offset_commit", &other)),
            Err(ClientError::Broker { code, message }) => {
                return Err(ClientError::Commit(format!("{:?}: {}", code, message)))
            }
            Err(e) => return Err(e),
        };
        let rejected: Vec<String> = response
            .partitions
            .iter()
            .filter(|p| !p.error.is_ok())
            .map(|p| format!("{}/{}: {:?}", p.topic, p.partition, p.error))
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Commit(rejected.join(", ")))
        }
    }

    async fn maybe_auto_commit(&mut self) {
        if !self.config.enable_auto_commit || self.config.group_id.is_none() {
            return;
        }
        if self.last_auto_commit.elapsed() < self.config.auto_commit_interval() {
            return;
        }
        self.last_auto_commit = Instant::now();
        if let Err(e) = self.commit().await {
            warn!(error = %e, "auto-commit failed");
        }
    }

    /// Move the fetch cursor of an idle partition.
    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.ensure_open()?;
        let cursor = self
            .cursors
            .get_mut(tp)
            .ok_or_else(|| ClientError::NotAssigned {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })?;
        if cursor.state != PartitionState::Fetching {
            return Err(ClientError::InvalidState {
                topic: tp.topic.clone(),
                partition: tp.partition,
                state: cursor.state.to_string(),
            });
        }
        debug!(%tp, from = cursor.position, to = offset, "seek");
        cursor.position = offset.max(0);
        cursor.last_delivered = None;
        Ok(())
    }

    /// Next offset that will be fetched for `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Result<i64> {
        self.ensure_open()?;
        self.cursors
            .get(tp)
            .map(|c| c.position)
            .ok_or_else(|| ClientError::NotAssigned {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    /// Committed offset of `tp` for the group, as stored by the broker.
    pub async fn committed(&mut self, tp: &TopicPartition) -> Result<Option<i64>> {
        self.ensure_open()?;
        if self.config.group_id.is_none() {
            return Err(ClientError::Config(
                "groupId is required to read committed offsets".into(),
            ));
        }
        let committed = self
            .fetch_committed(std::slice::from_ref(tp))
            .await?
            .get(tp)
            .copied()
            .flatten();
        if let Some(cursor) = self.cursors.get_mut(tp) {
            cursor.committed = committed;
        }
        Ok(committed)
    }

    pub fn partition_state(&self, tp: &TopicPartition) -> PartitionState {
        self.cursors
            .get(tp)
            .map(|c| c.state)
            .unwrap_or(PartitionState::Unassigned)
    }

    /// Group generation and member id sent with every commit. Group
    /// membership is coordinated outside this client.
    pub fn set_generation(&mut self, generation_id: i32, member_id: impl Into<String>) {
        self.generation_id = generation_id;
        self.member_id = member_id.into();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Commit delivered offsets when auto-commit is on, then close every
    /// partition and connection. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let committed = if self.config.enable_auto_commit && self.config.group_id.is_some() {
            self.commit().await
        } else {
            Ok(())
        };
        self.closed = true;
        for cursor in self.cursors.values_mut() {
            cursor.state = PartitionState::Closed;
        }
        self.manager.close().await;
        info!(client_id = %self.config.client_id, "consumer closed");
        committed
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
