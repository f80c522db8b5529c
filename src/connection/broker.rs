//! One TCP connection to a broker endpoint.
//!
//! A writer task owns the write half and writes queued frames whole, in
//! order, even when the caller stops waiting. A dispatcher task owns the
//! read half and completes pending callers by correlation id.

use crate::error::{ClientError, Result};
use crate::protocol::{
    decode_response, encode_request, split_frame, Request, Response, ResponseFrame, API_VERSION,
    CLIENT_APIS,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Pending = HashMap<i32, oneshot::Sender<Result<Response>>>;

/// State shared between callers and the dispatcher task.
struct Shared {
    endpoint: String,
    pending: Mutex<Pending>,
    /// Socket failed; no further requests are accepted.
    broken: AtomicBool,
    /// Closed by the owner.
    closed: AtomicBool,
}

impl Shared {
    fn register(&self, correlation_id: i32) -> Result<oneshot::Receiver<Result<Response>>> {
        let mut pending = self.pending.lock();
        self.check_writable()?;
        let (tx, rx) = oneshot::channel();
        pending.insert(correlation_id, tx);
        Ok(rx)
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(ClientError::Connection(format!(
                "connection to {} is broken",
                self.endpoint
            )));
        }
        Ok(())
    }

    /// Error for a frame the writer task can no longer take.
    fn writer_gone(&self) -> ClientError {
        if self.closed.load(Ordering::Acquire) {
            ClientError::Closed
        } else {
            ClientError::Connection(format!("writer for {} stopped", self.endpoint))
        }
    }

    fn take(&self, correlation_id: i32) -> Option<oneshot::Sender<Result<Response>>> {
        self.pending.lock().remove(&correlation_id)
    }

    /// Mark the connection unusable and fail every waiting caller.
    fn fail_all(&self, err: &ClientError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            self.broken.store(true, Ordering::Release);
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(err.duplicate()));
        }
    }
}

/// Removes the pending entry when the caller stops waiting early.
struct PendingGuard<'a> {
    shared: &'a Shared,
    correlation_id: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.take(self.correlation_id);
    }
}

/// One encoded frame and where to report the outcome of writing it.
struct WriteRequest {
    frame: BytesMut,
    done: oneshot::Sender<Result<()>>,
}

pub struct BrokerConnection {
    shared: Arc<Shared>,
    client_id: String,
    next_correlation_id: AtomicI32,
    writes: mpsc::UnboundedSender<WriteRequest>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    /// Connect, start the dispatcher and perform the api-versions handshake.
    pub async fn connect(
        endpoint: &str,
        client_id: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connect {} timed out after {:?}",
                    endpoint, connect_timeout
                ))
            })?
            .map_err(|e| ClientError::Connection(format!("connect {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            endpoint: endpoint.to_string(),
            pending: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&shared), read_half));
        let (writes, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(Arc::clone(&shared), write_half, queued));
        let conn = Arc::new(Self {
            shared,
            client_id: client_id.to_string(),
            next_correlation_id: AtomicI32::new(1),
            writes,
            writer: Mutex::new(Some(writer)),
            dispatcher: Mutex::new(Some(dispatcher)),
        });

        if let Err(e) = conn.handshake(request_timeout).await {
            conn.close().await;
            return Err(e);
        }
        debug!(endpoint, "broker handshake complete");
        Ok(conn)
    }

    async fn handshake(&self, timeout: Duration) -> Result<()> {
        let response = self.send(&Request::ApiVersions, timeout).await?;
        let versions = match response {
            Response::ApiVersions(v) => v,
            Response::Error(e) => {
                return Err(ClientError::Broker {
                    code: e.code,
                    message: e.message,
                })
            }
            other => return Err(super::unexpected_response("api_versions", &other)),
        };
        if !versions.error.is_ok() {
            return Err(ClientError::Broker {
                code: versions.error,
                message: "api_versions rejected".into(),
            });
        }
        for api_key in CLIENT_APIS {
            let supported = versions.api_keys.iter().any(|r| {
                r.api_key == api_key && r.min_version <= API_VERSION && API_VERSION <= r.max_version
            });
            if !supported {
                return Err(ClientError::Broker {
                    code: crate::protocol::ErrorCode::UnsupportedVersion,
                    message: format!(
                        "broker {} does not support api {} v{}",
                        self.shared.endpoint, api_key, API_VERSION
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// False once the socket failed or the connection was closed.
    pub fn is_usable(&self) -> bool {
        !self.shared.broken.load(Ordering::Acquire) && !self.shared.closed.load(Ordering::Acquire)
    }

    /// Send a request and wait for the response carrying its correlation id.
    pub async fn send(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.shared.register(correlation_id)?;
        let _guard = PendingGuard {
            shared: &*self.shared,
            correlation_id,
        };

        let mut frame = BytesMut::new();
        encode_request(correlation_id, Some(&self.client_id), request, &mut frame)?;
        self.write_frame(frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "connection to {} dropped request {}",
                self.shared.endpoint, correlation_id
            ))),
            Err(_) => {
                debug!(
                    endpoint = %self.shared.endpoint,
                    correlation_id,
                    "request timed out"
                );
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Write a request that the broker will not answer.
    pub async fn send_oneway(&self, request: &Request) -> Result<()> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = BytesMut::new();
        encode_request(correlation_id, Some(&self.client_id), request, &mut frame)?;
        self.write_frame(frame).await
    }

    /// Queue `frame` on the writer task and wait for it to hit the socket.
    /// Dropping this future does not cut the frame short.
    async fn write_frame(&self, frame: BytesMut) -> Result<()> {
        self.shared.check_writable()?;
        let (done, written) = oneshot::channel();
        if self.writes.send(WriteRequest { frame, done }).is_err() {
            return Err(self.shared.writer_gone());
        }
        written.await.unwrap_or_else(|_| Err(self.shared.writer_gone()))
    }

    /// Stop the dispatcher and fail pending callers with `Closed`.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.shared.fail_all(&ClientError::Closed);
        let writer = self.writer.lock().take();
        if let Some(handle) = writer {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(WriteRequest { frame, done }) = queued.recv().await {
        if let Err(e) = shared.check_writable() {
            let _ = done.send(Err(e));
            continue;
        }
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(e) => {
                let err =
                    ClientError::Connection(format!("write {} failed: {}", shared.endpoint, e));
                shared.fail_all(&err);
                let _ = done.send(Err(err));
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_dispatcher(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut read_buf = BytesMut::with_capacity(4096);
    let failure = loop {
        read_buf.reserve(4096);
        match reader.read_buf(&mut read_buf).await {
            Ok(0) => {
                break ClientError::Connection(format!(
                    "connection to {} closed by broker",
                    shared.endpoint
                ))
            }
            Ok(_) => {}
            Err(e) => {
                break ClientError::Connection(format!("read {} failed: {}", shared.endpoint, e))
            }
        }
        if let Err(e) = dispatch_frames(&shared, &mut read_buf) {
            break e;
        }
    };
    if !shared.closed.load(Ordering::Acquire) {
        warn!(endpoint = %shared.endpoint, error = %failure, "broker connection lost");
    }
    shared.fail_all(&failure);
}

fn dispatch_frames(shared: &Shared, read_buf: &mut BytesMut) -> Result<()> {
    while let Some(frame) = split_frame(read_buf)? {
        let ResponseFrame {
            correlation_id,
            response,
        } = decode_response(&frame)?;
        match shared.take(correlation_id) {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => debug!(
                endpoint = %shared.endpoint,
                correlation_id,
                "dropping response with no waiting caller"
            ),
        }
    }
    Ok(())
}
