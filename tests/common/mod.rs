//! In-process broker speaking the client wire protocol.
//!
//! Single node (id 0) leading every partition. Topics are created on first
//! metadata request with the broker's default partition count. Fetches
//! long-poll until data arrives or `max_wait_ms` passes.

#![allow(dead_code)]

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thorstream_client::protocol::{
    decode_request, encode_response, split_frame, ApiVersionRange, ApiVersionsResponse,
    BrokerMetadata, CommittedOffset, ErrorCode, FetchPartitionResponse, FetchRequest,
    FetchResponse, ListOffsetsPartitionResponse, ListOffsetsResponse, MetadataResponse,
    OffsetCommitResponse, OffsetFetchResponse, OffsetSpec, PartitionMetadata, PartitionResult,
    ProduceResponse, Request, RequestFrame, Response, StoredRecord, TopicMetadata, API_VERSION,
    CLIENT_APIS,
};
use thorstream_client::{ClientConfig, TopicPartition};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Log {
    topics: HashMap<String, i32>,
    partitions: HashMap<TopicPartition, Vec<StoredRecord>>,
    /// (group, partition) -> last processed offset.
    committed: HashMap<(String, TopicPartition), i64>,
    /// Record count of every produce request, per partition.
    batches: HashMap<TopicPartition, Vec<usize>>,
    not_leader_once: HashSet<TopicPartition>,
    /// One-shot error codes for the next fetch of a partition.
    fetch_errors: HashMap<TopicPartition, ErrorCode>,
    required_generation: Option<i32>,
}

struct State {
    log: Mutex<Log>,
    appended: Notify,
    default_partitions: i32,
    port: u16,
    /// Answer only the handshake.
    silent: AtomicBool,
    /// Serve fetches from the start of the log regardless of the offset asked.
    replay_fetches: AtomicBool,
    metadata_requests: AtomicUsize,
    /// Incoming connections still to be closed right after accept.
    refuse: AtomicUsize,
    accepted: AtomicUsize,
    /// Wakes every connection handler so it hangs up.
    hang_up: Notify,
}

pub struct MockBroker {
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::with_partitions(1).await
    }

    pub async fn with_partitions(default_partitions: i32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            log: Mutex::new(Log::default()),
            appended: Notify::new(),
            default_partitions,
            port,
            silent: AtomicBool::new(false),
            replay_fetches: AtomicBool::new(false),
            metadata_requests: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            hang_up: Notify::new(),
        });
        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                let refused = accept_state
                    .refuse
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    drop(stream);
                    continue;
                }
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(Arc::clone(&accept_state), stream));
            }
        });
        Self { state, accept }
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.state.port)
    }

    /// Client config pointed at this broker, with short timeouts.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            endpoints: vec![self.endpoint()],
            client_id: "test-client".to_string(),
            request_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            delivery_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 10,
            retry_backoff_max_ms: 50,
            linger_ms: 5,
            ..ClientConfig::default()
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.state
            .log
            .lock()
            .topics
            .insert(topic.to_string(), partitions);
    }

    /// Append values directly to a partition's log.
    pub fn append<V: AsRef<[u8]>>(&self, topic: &str, partition: i32, values: &[V]) {
        {
            let mut log = self.state.log.lock();
            log.topics
                .entry(topic.to_string())
                .or_insert(self.state.default_partitions);
            let entries = log
                .partitions
                .entry(TopicPartition::new(topic, partition))
                .or_default();
            for value in values {
                let offset = entries.len() as i64;
                entries.push(StoredRecord {
                    offset,
                    key: None,
                    value: value.as_ref().to_vec(),
                    headers: Vec::new(),
                    timestamp: 0,
                });
            }
        }
        self.state.appended.notify_waiters();
    }

    pub fn records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        self.state
            .log
            .lock()
            .partitions
            .get(&TopicPartition::new(topic, partition))
            .cloned()
            .unwrap_or_default()
    }

    pub fn values(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        self.records(topic, partition)
            .into_iter()
            .map(|r| r.value)
            .collect()
    }

    /// Record counts of the produce requests received for a partition.
    pub fn batches(&self, topic: &str, partition: i32) -> Vec<usize> {
        self.state
            .log
            .lock()
            .batches
            .get(&TopicPartition::new(topic, partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Reject the next produce to `tp` with NotLeaderForPartition.
    pub fn fail_next_produce(&self, tp: TopicPartition) {
        self.state.log.lock().not_leader_once.insert(tp);
    }

    /// Answer the next fetch of `tp` with `code` instead of its records.
    pub fn fail_next_fetch(&self, tp: TopicPartition, code: ErrorCode) {
        self.state.log.lock().fetch_errors.insert(tp, code);
    }

    /// Reject commits whose generation differs from `generation_id`.
    pub fn require_generation(&self, generation_id: i32) {
        self.state.log.lock().required_generation = Some(generation_id);
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.state
            .log
            .lock()
            .committed
            .get(&(group_id.to_string(), tp.clone()))
            .copied()
    }

    pub fn metadata_requests(&self) -> usize {
        self.state.metadata_requests.load(Ordering::SeqCst)
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_replay_fetches(&self, replay: bool) {
        self.state.replay_fetches.store(replay, Ordering::SeqCst);
    }

    /// Close every open client connection from the broker side.
    pub fn drop_connections(&self) {
        self.state.hang_up.notify_waiters();
    }

    /// Hang up on the next `count` incoming connections right after accept.
    pub fn refuse_connections(&self, count: usize) {
        self.state.refuse.store(count, Ordering::SeqCst);
    }

    /// Connections accepted and served so far.
    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn handle_connection(state: Arc<State>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        read_buf.reserve(4096);
        let read = tokio::select! {
            read = reader.read_buf(&mut read_buf) => read,
            _ = state.hang_up.notified() => return,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        loop {
            let frame = match split_frame(&mut read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            let RequestFrame { header, request } = match decode_request(&frame) {
                Ok(decoded) => decoded,
                Err(_) => return,
            };
            let correlation_id = header.correlation_id;
            if state.silent.load(Ordering::SeqCst) && !matches!(request, Request::ApiVersions) {
                continue;
            }
            match request {
                // Long polls run concurrently so they can answer out of order.
                Request::Fetch(fetch) => {
                    let state = Arc::clone(&state);
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        let response = handle_fetch(&state, fetch).await;
                        respond(&writer, correlation_id, &response).await;
                    });
                }
                request => {
                    let reply = request.expects_response();
                    if let Some(response) = handle(&state, request) {
                        if reply {
                            respond(&writer, correlation_id, &response).await;
                        }
                    }
                }
            }
        }
    }
}

async fn respond(
    writer: &tokio::sync::Mutex<OwnedWriteHalf>,
    correlation_id: i32,
    response: &Response,
) {
    let mut buf = BytesMut::new();
    encode_response(correlation_id, response, &mut buf).unwrap();
    let mut writer = writer.lock().await;
    let _ = writer.write_all(&buf).await;
}

fn handle(state: &State, request: Request) -> Option<Response> {
    match request {
        Request::ApiVersions => Some(Response::ApiVersions(ApiVersionsResponse {
            error: ErrorCode::None,
            api_keys: CLIENT_APIS
                .iter()
                .map(|&api_key| ApiVersionRange {
                    api_key,
                    min_version: 0,
                    max_version: API_VERSION,
                })
                .collect(),
        })),
        Request::Metadata(req) => {
            state.metadata_requests.fetch_add(1, Ordering::SeqCst);
            let mut log = state.log.lock();
            let names: Vec<String> = if req.topics.is_empty() {
                log.topics.keys().cloned().collect()
            } else {
                req.topics
            };
            let topics = names
                .into_iter()
                .map(|name| {
                    let count = *log
                        .topics
                        .entry(name.clone())
                        .or_insert(state.default_partitions);
                    TopicMetadata {
                        name,
                        error: ErrorCode::None,
                        partitions: (0..count)
                            .map(|p| PartitionMetadata {
                                partition_id: p,
                                leader_id: 0,
                                replicas: vec![0],
                            })
                            .collect(),
                    }
                })
                .collect();
            Some(Response::Metadata(MetadataResponse {
                brokers: vec![BrokerMetadata {
                    node_id: 0,
                    host: "127.0.0.1".to_string(),
                    port: state.port,
                }],
                topics,
            }))
        }
        Request::Produce(req) => {
            let tp = TopicPartition::new(req.topic.clone(), req.partition);
            let mut log = state.log.lock();
            let known = log
                .topics
                .get(&req.topic)
                .map(|&n| req.partition >= 0 && req.partition < n)
                .unwrap_or(false);
            let (error, base_offset) = if !known {
                (ErrorCode::UnknownTopicOrPartition, -1)
            } else if log.not_leader_once.remove(&tp) {
                (ErrorCode::NotLeaderForPartition, -1)
            } else {
                let count = req.records.len();
                let entries = log.partitions.entry(tp.clone()).or_default();
                let base_offset = entries.len() as i64;
                for (i, record) in req.records.into_iter().enumerate() {
                    entries.push(StoredRecord {
                        offset: base_offset + i as i64,
                        key: record.key,
                        value: record.value,
                        headers: record.headers,
                        timestamp: record.timestamp,
                    });
                }
                log.batches.entry(tp).or_default().push(count);
                (ErrorCode::None, base_offset)
            };
            drop(log);
            state.appended.notify_waiters();
            Some(Response::Produce(ProduceResponse {
                topic: req.topic,
                partition: req.partition,
                error,
                base_offset,
                log_append_time: 0,
            }))
        }
        Request::ListOffsets(req) => {
            let log = state.log.lock();
            let partitions = req
                .partitions
                .into_iter()
                .map(|p| {
                    let tp = TopicPartition::new(p.topic.clone(), p.partition);
                    let end = log.partitions.get(&tp).map(|e| e.len()).unwrap_or(0) as i64;
                    ListOffsetsPartitionResponse {
                        topic: p.topic,
                        partition: p.partition,
                        error: ErrorCode::None,
                        offset: match p.spec {
                            OffsetSpec::Earliest => 0,
                            OffsetSpec::Latest => end,
                        },
                    }
                })
                .collect();
            Some(Response::ListOffsets(ListOffsetsResponse { partitions }))
        }
        Request::OffsetCommit(req) => {
            let mut log = state.log.lock();
            let stale = log
                .required_generation
                .map(|g| g != req.generation_id)
                .unwrap_or(false);
            let mut partitions = Vec::new();
            for offset in req.offsets {
                let error = if stale {
                    ErrorCode::IllegalGeneration
                } else {
                    log.committed.insert(
                        (
                            req.group_id.clone(),
                            TopicPartition::new(offset.topic.clone(), offset.partition),
                        ),
                        offset.offset,
                    );
                    ErrorCode::None
                };
                partitions.push(PartitionResult {
                    topic: offset.topic,
                    partition: offset.partition,
                    error,
                });
            }
            Some(Response::OffsetCommit(OffsetCommitResponse { partitions }))
        }
        Request::OffsetFetch(req) => {
            let log = state.log.lock();
            let partitions = req
                .partitions
                .into_iter()
                .map(|tp| CommittedOffset {
                    offset: log
                        .committed
                        .get(&(req.group_id.clone(), tp.clone()))
                        .copied(),
                    topic: tp.topic,
                    partition: tp.partition,
                    error: ErrorCode::None,
                })
                .collect();
            Some(Response::OffsetFetch(OffsetFetchResponse { partitions }))
        }
        Request::Fetch(_) => None,
    }
}

async fn handle_fetch(state: &State, req: FetchRequest) -> Response {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(req.max_wait_ms as u64);
    loop {
        let notified = state.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (partitions, ready) = read_partitions(state, &req);
        if ready || tokio::time::Instant::now() >= deadline {
            return Response::Fetch(FetchResponse { partitions });
        }
        let _ = tokio::time::timeout_at(deadline, notified).await;
    }
}

fn read_partitions(state: &State, req: &FetchRequest) -> (Vec<FetchPartitionResponse>, bool) {
    let mut log = state.log.lock();
    let replay = state.replay_fetches.load(Ordering::SeqCst);
    let mut ready = false;
    let mut partitions = Vec::new();
    for p in &req.partitions {
        let tp = TopicPartition::new(p.topic.clone(), p.partition);
        if let Some(error) = log.fetch_errors.remove(&tp) {
            partitions.push(FetchPartitionResponse {
                topic: p.topic.clone(),
                partition: p.partition,
                error,
                high_water_mark: -1,
                log_start_offset: -1,
                records: Vec::new(),
            });
            ready = true;
            continue;
        }
        let known = log
            .topics
            .get(&p.topic)
            .map(|&n| p.partition >= 0 && p.partition < n)
            .unwrap_or(false);
        let entries = log.partitions.get(&tp).map(|e| e.as_slice()).unwrap_or(&[]);
        let end = entries.len() as i64;
        let mut response = FetchPartitionResponse {
            topic: p.topic.clone(),
            partition: p.partition,
            error: ErrorCode::None,
            high_water_mark: end,
            log_start_offset: 0,
            records: Vec::new(),
        };
        if !known {
            response.error = ErrorCode::UnknownTopicOrPartition;
            ready = true;
        } else if p.offset < 0 || p.offset > end {
            response.error = ErrorCode::OffsetOutOfRange;
            ready = true;
        } else {
            let start = if replay { 0 } else { p.offset as usize };
            let mut budget = p.max_bytes as usize;
            for record in &entries[start..] {
                let size = record.value.len() + record.key.as_ref().map(|k| k.len()).unwrap_or(0);
                if !response.records.is_empty() && size > budget {
                    break;
                }
                budget = budget.saturating_sub(size);
                response.records.push(record.clone());
            }
            ready |= !response.records.is_empty();
        }
        partitions.push(response);
    }
    (partitions, ready)
}
