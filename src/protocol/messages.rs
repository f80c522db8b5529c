//! Request and response bodies exchanged with the broker.

use crate::error::ClientError;
use crate::types::{RecordHeader, TopicPartition};
use serde::{Deserialize, Serialize};

pub const API_PRODUCE: i16 = 0;
pub const API_FETCH: i16 = 1;
pub const API_LIST_OFFSETS: i16 = 2;
pub const API_METADATA: i16 = 3;
pub const API_OFFSET_COMMIT: i16 = 8;
pub const API_OFFSET_FETCH: i16 = 9;
pub const API_API_VERSIONS: i16 = 18;
/// Response-only key for top-level broker errors.
pub const API_ERROR: i16 = -1;

/// Every api the client issues; checked against the broker during the handshake.
pub const CLIENT_APIS: [i16; 7] = [
    API_PRODUCE,
    API_FETCH,
    API_LIST_OFFSETS,
    API_METADATA,
    API_OFFSET_COMMIT,
    API_OFFSET_FETCH,
    API_API_VERSIONS,
];

/// Broker error codes carried per partition or per response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    None,
    UnknownTopicOrPartition,
    NotLeaderForPartition,
    LeaderNotAvailable,
    OffsetOutOfRange,
    RequestTimedOut,
    NotEnoughReplicas,
    IllegalGeneration,
    UnknownMemberId,
    CorruptMessage,
    UnsupportedVersion,
    Unknown,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::None
    }

    /// Map a per-partition code onto the client taxonomy.
    pub fn check(self, topic: &str, partition: i32) -> Result<(), ClientError> {
        match self {
            ErrorCode::None => Ok(()),
            ErrorCode::NotLeaderForPartition | ErrorCode::LeaderNotAvailable => {
                Err(ClientError::NotLeader {
                    topic: topic.to_string(),
                    partition,
                })
            }
            ErrorCode::UnknownTopicOrPartition => Err(ClientError::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition,
            }),
            ErrorCode::CorruptMessage => Err(ClientError::MalformedFrame(format!(
                "broker rejected batch for {}/{} as corrupt",
                topic, partition
            ))),
            code => Err(ClientError::Broker {
                code,
                message: format!("{}/{}", topic, partition),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    /// Empty means all topics.
    pub topics: Vec<String>,
}

/// Record as carried inside a produce batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: i64,
}

impl BatchRecord {
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.value.len())
            .sum();
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) + self.value.len() + headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    /// 0 = none, 1 = leader, -1 = all.
    pub acks: i16,
    pub timeout_ms: u32,
    pub topic: String,
    pub partition: i32,
    pub records: Vec<BatchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPartition {
    pub topic: String,
    pub partition: i32,
    /// Next offset to read.
    pub offset: i64,
    pub max_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// How long the broker may hold the request when no data is available.
    pub max_wait_ms: u32,
    pub min_bytes: u32,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetSpec {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffsetsPartition {
    pub topic: String,
    pub partition: i32,
    pub spec: OffsetSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffsetsRequest {
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub offsets: Vec<CommitOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub partitions: Vec<TopicPartition>,
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ApiVersions,
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
}

impl Request {
    pub fn api_key(&self) -> i16 {
        match self {
            Request::ApiVersions => API_API_VERSIONS,
            Request::Metadata(_) => API_METADATA,
            Request::Produce(_) => API_PRODUCE,
            Request::Fetch(_) => API_FETCH,
            Request::ListOffsets(_) => API_LIST_OFFSETS,
            Request::OffsetCommit(_) => API_OFFSET_COMMIT,
            Request::OffsetFetch(_) => API_OFFSET_FETCH,
        }
    }

    /// Produce with `acks=0` gets no response from the broker.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::Produce(p) if p.acks == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersionsResponse {
    pub error: ErrorCode,
    pub api_keys: Vec<ApiVersionRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
}

impl BrokerMetadata {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub partition_id: i32,
    /// -1 while no leader is elected.
    pub leader_id: i32,
    pub replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub error: ErrorCode,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub topic: String,
    pub partition: i32,
    pub error: ErrorCode,
    /// Offset assigned to the first record of the batch.
    pub base_offset: i64,
    pub log_append_time: i64,
}

/// Record as returned by a fetch, with its assigned offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPartitionResponse {
    pub topic: String,
    pub partition: i32,
    pub error: ErrorCode,
    pub high_water_mark: i64,
    pub log_start_offset: i64,
    pub records: Vec<StoredRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffsetsPartitionResponse {
    pub topic: String,
    pub partition: i32,
    pub error: ErrorCode,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffsetsResponse {
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub topic: String,
    pub partition: i32,
    pub error: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommitResponse {
    pub partitions: Vec<PartitionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    /// `None` when the group never committed this partition.
    pub offset: Option<i64>,
    pub error: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetFetchResponse {
    pub partitions: Vec<CommittedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Broker response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ApiVersions(ApiVersionsResponse),
    Metadata(MetadataResponse),
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    ListOffsets(ListOffsetsResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn api_key(&self) -> i16 {
        match self {
            Response::ApiVersions(_) => API_API_VERSIONS,
            Response::Metadata(_) => API_METADATA,
            Response::Produce(_) => API_PRODUCE,
            Response::Fetch(_) => API_FETCH,
            Response::ListOffsets(_) => API_LIST_OFFSETS,
            Response::OffsetCommit(_) => API_OFFSET_COMMIT,
            Response::OffsetFetch(_) => API_OFFSET_FETCH,
            Response::Error(_) => API_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::ApiVersions(_) => "api_versions",
            Response::Metadata(_) => "metadata",
            Response::Produce(_) => "produce",
            Response::Fetch(_) => "fetch",
            Response::ListOffsets(_) => "list_offsets",
            Response::OffsetCommit(_) => "offset_commit",
            Response::OffsetFetch(_) => "offset_fetch",
            Response::Error(_) => "error",
        }
    }
}
