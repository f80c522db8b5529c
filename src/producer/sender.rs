//! Background tasks of the producer.
//!
//! The accumulator task owns the open batches and decides when each one is
//! ready (size, record count, linger or an explicit flush). Ready batches go
//! to a lane task per partition, which delivers them one at a time so that
//! records of a partition are appended in send order.

use super::batch::{BatchOutcome, PendingRecord, ProducerBatch};
use super::ProducerInner;
use crate::config::Acks;
use crate::connection::unexpected_response;
use crate::error::{ClientError, Result};
use crate::protocol::{Request, Response};
use crate::types::TopicPartition;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn, Instrument};

pub(crate) enum Command {
    Append {
        tp: TopicPartition,
        pending: PendingRecord,
    },
    /// Make every open batch ready now.
    Flush,
    /// Flush and stop accepting commands.
    Close,
}

type Lane = mpsc::UnboundedSender<ProducerBatch>;

pub(crate) async fn run_accumulator(
    inner: Arc<ProducerInner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let linger = inner.config.linger();
    let max_bytes = inner.config.batch_max_bytes;
    let max_records = inner.config.batch_max_records;
    let mut open: HashMap<TopicPartition, ProducerBatch> = HashMap::new();
    let mut lanes: HashMap<TopicPartition, Lane> = HashMap::new();

    loop {
        let deadline = open.values().map(|b| b.created_at() + linger).min();
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let now = Instant::now();
                let expired: Vec<TopicPartition> = open
                    .iter()
                    .filter(|(_, batch)| batch.created_at() + linger <= now)
                    .map(|(tp, _)| tp.clone())
                    .collect();
                for tp in expired {
                    if let Some(batch) = open.remove(&tp) {
                        dispatch(&inner, &mut lanes, batch);
                    }
                }
                continue;
            }
        };

        match command {
            Some(Command::Append { tp, pending }) => {
                let bytes = pending.record.encoded_len();
                let rollover = open
                    .get(&tp)
                    .map(|batch| !batch.has_room_for(bytes, max_bytes, max_records))
                    .unwrap_or(false);
                if rollover {
                    if let Some(batch) = open.remove(&tp) {
                        dispatch(&inner, &mut lanes, batch);
                    }
                }
                let batch = open
                    .entry(tp.clone())
                    .or_insert_with(|| ProducerBatch::new(tp.clone()));
                batch.push(pending);
                if linger.is_zero() || batch.is_full(max_bytes, max_records) {
                    if let Some(batch) = open.remove(&tp) {
                        dispatch(&inner, &mut lanes, batch);
                    }
                }
            }
            Some(Command::Flush) => {
                for (_, batch) in open.drain() {
                    dispatch(&inner, &mut lanes, batch);
                }
            }
            Some(Command::Close) | None => {
                for (_, batch) in open.drain() {
                    dispatch(&inner, &mut lanes, batch);
                }
                break;
            }
        }
    }
    debug!(lanes = lanes.len(), "producer accumulator stopped");
}

fn dispatch(
    inner: &Arc<ProducerInner>,
    lanes: &mut HashMap<TopicPartition, Lane>,
    batch: ProducerBatch,
) {
    let tp = batch.tp().clone();
    let lane = lanes
        .entry(tp.clone())
        .or_insert_with(|| spawn_lane(Arc::clone(inner), tp.clone()));
    if let Err(mpsc::error::SendError(batch)) = lane.send(batch) {
        lanes.remove(&tp);
        batch.complete(BatchOutcome::Failed(ClientError::Closed));
    }
}

fn spawn_lane(inner: Arc<ProducerInner>, tp: TopicPartition) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProducerBatch>();
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            deliver(&inner, &tp, batch).await;
        }
    });
    tx
}

async fn deliver(inner: &ProducerInner, tp: &TopicPartition, batch: ProducerBatch) {
    let acks = inner.config.acks;
    let timeout = inner.config.delivery_timeout();
    let request = Request::Produce(batch.to_request(
        acks.as_wire(),
        inner.config.request_timeout_ms.min(u32::MAX as u64) as u32,
    ));
    let records = batch.len();
    inner.metrics.record_batch();

    let span = tracing::debug_span!(
        "produce",
        topic = %tp.topic,
        partition = tp.partition,
        records,
        bytes = batch.size_bytes()
    );
    let send = async {
        let result: Result<Option<i64>> = match acks {
            Acks::None => {
                let endpoint = inner.manager.leader_endpoint(tp).await?;
                inner.manager.send_oneway(&endpoint, &request).await?;
                Ok(None)
            }
            Acks::Leader | Acks::All => inner
                .manager
                .send_to_leader(tp, &request, |response| produce_ack(tp, response))
                .await
                .map(Some),
        };
        result
    };
    let outcome = match tokio::time::timeout(timeout, send.instrument(span)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    };

    match outcome {
        Ok(base_offset) => {
            debug!(%tp, records, ?base_offset, "batch acknowledged");
            inner.metrics.record_delivery(records, true);
            batch.complete(BatchOutcome::Acknowledged { base_offset });
        }
        Err(e) => {
            warn!(%tp, records, error = %e, "batch delivery failed");
            inner.metrics.record_delivery(records, false);
            batch.complete(BatchOutcome::Failed(e));
        }
    }
}

fn produce_ack(tp: &TopicPartition, response: Response) -> Result<i64> {
    match response {
        Response::Produce(ack) => {
            ack.error.check(&tp.topic, tp.partition)?;
            Ok(ack.base_offset)
        }
        other => Err(unexpected_response("produce", &other)),
    }
}
