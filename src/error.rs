//! Error types for the client core.

use crate::protocol::ErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the producer, consumer and connection layers.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transient network failure; retried internally up to `max_retries`.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not leader for partition: {topic}/{partition}")]
    NotLeader { topic: String, partition: i32 },

    /// Protocol mismatch between client and broker. Never retried.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Client is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown topic or partition: {topic}/{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("Partition not assigned: {topic}/{partition}")]
    NotAssigned { topic: String, partition: i32 },

    #[error("Invalid state for {topic}/{partition}: {state}")]
    InvalidState {
        topic: String,
        partition: i32,
        state: String,
    },

    #[error("Broker error {code:?}: {message}")]
    Broker { code: ErrorCode, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the connection layer should retry the call with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }

    /// Copy of this error for fanning one failure out to several waiters.
    /// `Io` has no `Clone`, so it degrades to `Connection` with its message.
    pub(crate) fn duplicate(&self) -> ClientError {
        match self {
            ClientError::Connection(m) => ClientError::Connection(m.clone()),
            ClientError::Timeout(d) => ClientError::Timeout(*d),
            ClientError::NotLeader { topic, partition } => ClientError::NotLeader {
                topic: topic.clone(),
                partition: *partition,
            },
            ClientError::MalformedFrame(m) => ClientError::MalformedFrame(m.clone()),
            ClientError::Commit(m) => ClientError::Commit(m.clone()),
            ClientError::Closed => ClientError::Closed,
            ClientError::Config(m) => ClientError::Config(m.clone()),
            ClientError::UnknownTopicOrPartition { topic, partition } => {
                ClientError::UnknownTopicOrPartition {
                    topic: topic.clone(),
                    partition: *partition,
                }
            }
            ClientError::NotAssigned { topic, partition } => ClientError::NotAssigned {
                topic: topic.clone(),
                partition: *partition,
            },
            ClientError::InvalidState {
                topic,
                partition,
                state,
            } => ClientError::InvalidState {
                topic: topic.clone(),
                partition: *partition,
                state: state.clone(),
            },
            ClientError::Broker { code, message } => ClientError::Broker {
                code: *code,
                message: message.clone(),
            },
            ClientError::Serialization(m) => ClientError::Serialization(m.clone()),
            ClientError::Io(e) => ClientError::Connection(e.to_string()),
        }
    }
}
