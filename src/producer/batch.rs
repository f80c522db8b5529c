//! Per-partition record batches and the in-flight record counter.

use crate::error::{ClientError, Result};
use crate::protocol::{BatchRecord, ProduceRequest};
use crate::types::{RecordMetadata, TopicPartition};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Counts records accepted by `send` whose futures are not yet resolved.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn acquire(self: &Arc<Self>) -> InFlightPermit {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightPermit(Arc::clone(self))
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once every acquired permit has been released.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a record until its delivery future is resolved.
#[derive(Debug)]
pub(crate) struct InFlightPermit(Arc<InFlight>);

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A record waiting in the accumulator, with the sender half of its future.
/// Dropping it unresolved makes the future fail with `Closed`.
#[derive(Debug)]
pub(crate) struct PendingRecord {
    pub record: BatchRecord,
    pub tx: oneshot::Sender<Result<RecordMetadata>>,
    pub _permit: InFlightPermit,
}

pub(crate) enum BatchOutcome {
    /// `base_offset` is `None` for `acks=none`.
    Acknowledged { base_offset: Option<i64> },
    Failed(ClientError),
}

/// Records for one partition, sent to the leader as a single produce request.
#[derive(Debug)]
pub(crate) struct ProducerBatch {
    tp: TopicPartition,
    records: Vec<PendingRecord>,
    size_bytes: usize,
    created_at: Instant,
}

impl ProducerBatch {
    pub fn new(tp: TopicPartition) -> Self {
        Self {
            tp,
            records: Vec::new(),
            size_bytes: 0,
            created_at: Instant::now(),
        }
    }

    pub fn tp(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// An empty batch always accepts, so oversized records still go out alone.
    pub fn has_room_for(&self, bytes: usize, max_bytes: usize, max_records: usize) -> bool {
        self.is_empty()
            || (self.records.len() < max_records && self.size_bytes + bytes <= max_bytes)
    }

    pub fn is_full(&self, max_bytes: usize, max_records: usize) -> bool {
        self.records.len() >= max_records || self.size_bytes >= max_bytes
    }

    pub fn push(&mut self, pending: PendingRecord) {
        self.size_bytes += pending.record.encoded_len();
        self.records.push(pending);
    }

    pub fn to_request(&self, acks: i16, timeout_ms: u32) -> ProduceRequest {
        ProduceRequest {
            acks,
            timeout_ms,
            topic: self.tp.topic.clone(),
            partition: self.tp.partition,
            records: self.records.iter().map(|p| p.record.clone()).collect(),
        }
    }

    /// Resolve every future in the batch. Acknowledged records get
    /// consecutive offsets from the base, in append order.
    pub fn complete(self, outcome: BatchOutcome) {
        let ProducerBatch { tp, records, .. } = self;
        match outcome {
            BatchOutcome::Acknowledged { base_offset } => {
                for (i, pending) in records.into_iter().enumerate() {
                    let metadata = RecordMetadata {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: base_offset.map(|base| base + i as i64),
                        timestamp: pending.record.timestamp,
                    };
                    let _ = pending.tx.send(Ok(metadata));
                }
            }
            BatchOutcome::Failed(err) => {
                for pending in records {
                    let _ = pending.tx.send(Err(err.duplicate()));
                }
            }
        }
    }
}
