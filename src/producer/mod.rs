//! Producer: asynchronous, batched record delivery to partition leaders.
//!
//! `send` resolves the target partition, hands the record to the background
//! accumulator and returns a [`DeliveryFuture`] right away. The future
//! resolves with the record's offset once its batch is acknowledged, or with
//! the error that failed the batch.

mod batch;
pub mod partitioner;
mod sender;

pub use partitioner::{murmur2, partition_for_key, Partitioner};

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{ClientError, Result};
use crate::observability::ClientMetrics;
use crate::protocol::BatchRecord;
use crate::types::{Record, RecordMetadata, TopicPartition};
use batch::{InFlight, PendingRecord};
use parking_lot::Mutex;
use sender::Command;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Resolves with the delivery result of one record.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
}

impl Future for DeliveryFuture {
    type Output = Result<RecordMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a result: the producer shut down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// State shared by the producer handle and its background tasks.
pub(crate) struct ProducerInner {
    config: Arc<ClientConfig>,
    manager: ConnectionManager,
    partitioner: Partitioner,
    in_flight: Arc<InFlight>,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
}

pub struct Producer {
    inner: Arc<ProducerInner>,
    commands: mpsc::UnboundedSender<Command>,
    accumulator: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Validate `config` and start the background accumulator. Must be
    /// called within a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(Arc::new(config)))
    }

    pub(crate) fn with_config(config: Arc<ClientConfig>) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let inner = Arc::new(ProducerInner {
            manager: ConnectionManager::new(Arc::clone(&config), Arc::clone(&metrics)),
            config,
            partitioner: Partitioner::new(),
            in_flight: Arc::new(InFlight::default()),
            metrics,
            closed: AtomicBool::new(false),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let accumulator = tokio::spawn(sender::run_accumulator(Arc::clone(&inner), rx));
        debug!(client_id = %inner.config.client_id, "producer started");
        Self {
            inner,
            commands,
            accumulator: Mutex::new(Some(accumulator)),
        }
    }

    /// Queue `record` for delivery.
    ///
    /// Fails immediately with `Closed` after [`close`](Self::close), and with
    /// `UnknownTopicOrPartition` when an explicit partition does not exist.
    /// Delivery errors surface through the returned future.
    pub async fn send(&self, record: Record) -> Result<DeliveryFuture> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let tp = self.resolve_partition(&record).await?;
        let (key, value, headers, timestamp) = record.into_parts();
        let (tx, rx) = oneshot::channel();
        let pending = PendingRecord {
            record: BatchRecord {
                key,
                value,
                headers,
                timestamp,
            },
            tx,
            _permit: self.inner.in_flight.acquire(),
        };
        if self.commands.send(Command::Append { tp, pending }).is_err() {
            return Err(ClientError::Closed);
        }
        self.inner.metrics.record_enqueued();
        Ok(DeliveryFuture { rx })
    }

    /// Send and wait for the acknowledgement.
    pub async fn send_and_wait(&self, record: Record) -> Result<RecordMetadata> {
        self.send(record).await?.await
    }

    async fn resolve_partition(&self, record: &Record) -> Result<TopicPartition> {
        let topic = record.topic();
        let num_partitions = self.inner.manager.partition_count(topic).await?;
        let partition = match record.partition() {
            Some(p) if p >= 0 && p < num_partitions => p,
            Some(p) => {
                return Err(ClientError::UnknownTopicOrPartition {
                    topic: topic.to_string(),
                    partition: p,
                })
            }
            None => self
                .inner
                .partitioner
                .partition(topic, record.key(), num_partitions),
        };
        Ok(TopicPartition::new(topic, partition))
    }

    /// Wait until every record sent so far is acknowledged or failed, at
    /// most `delivery_timeout_ms`.
    pub async fn flush(&self) -> Result<()> {
        let _ = self.commands.send(Command::Flush);
        let timeout = self.inner.config.delivery_timeout();
        tokio::time::timeout(timeout, self.inner.in_flight.wait_idle())
            .await
            .map_err(|_| ClientError::Timeout(timeout))
    }

    /// Records accepted by `send` whose futures have not resolved.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush, then release every connection. Later sends fail with `Closed`;
    /// requests still in flight when the connections drop fail with `Closed`.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(client_id = %self.inner.config.client_id, "closing producer");
        let flushed = self.flush().await;
        let _ = self.commands.send(Command::Close);
        self.inner.manager.close().await;
        let accumulator = self.accumulator.lock().take();
        if let Some(handle) = accumulator {
            let _ = handle.await;
        }
        flushed
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.inner.metrics
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}
