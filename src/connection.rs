//! Async driver: runs a [`Link`] over any byte stream.
//!
//! ```text
//! caller ─► ConnectionHandle ─► mpsc<Bytes> ─► writer task ─► stream
//! stream ─► read loop ─► Link::on_frame ─► registry / events channel
//! ```
//!
//! The writer task batches whatever frames are queued into a single flush.
//! When the read side ends (EOF or error) or a write fails, the registry is
//! closed: every pending request, and every request issued afterwards, fails
//! with [`Failure::Closed`](crate::correlation::Failure::Closed).
//!
//! # Example
//!
//! ```ignore
//! use imgwire::{codec::Role, Connection, Link};
//! use serde_json::json;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let mut conn = Connection::spawn(stream, Link::new(Role::Client));
//!
//! let reply = conn.handle().request("loadImage", &json!({"path": "t1.nii"})).await?;
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{Envelope, FrameCodec};
use crate::correlation::{Checksum, CorrelationRegistry, Reply};
use crate::error::{LinkError, Result};
use crate::link::Link;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default capacity of the unrouted-envelope queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Size of each socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frames written before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Cloneable handle for issuing requests and replies on a connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Bytes>,
    codec: FrameCodec,
    registry: CorrelationRegistry,
    default_timeout: Option<Duration>,
}

impl ConnectionHandle {
    /// Send request `name` and wait for its reply.
    ///
    /// The wire payload is `{"id": <id>, "data": data}`.
    pub async fn request<T: Serialize>(&self, name: &str, data: &T) -> Result<Reply> {
        let (id, reply) = self.registry.register_request(name);
        if let Some(timeout) = self.default_timeout {
            self.registry.attach_timeout(id, timeout);
        }

        let frame = match self.codec.encode_json(name, &json!({ "id": id, "data": data })) {
            Ok(frame) => frame,
            Err(e) => {
                self.registry.reject(id, Value::String(e.to_string()));
                return Err(e);
            }
        };
        if let Err(e) = self.write(Bytes::from(frame)).await {
            self.registry.reject(id, Value::String(e.to_string()));
            return Err(e);
        }

        Ok(reply.await?)
    }

    /// Send a fire-and-forget envelope.
    pub async fn emit<T: Serialize>(&self, kind: &str, data: &T) -> Result<()> {
        let frame = self.codec.encode_json(kind, data)?;
        self.write(Bytes::from(frame)).await
    }

    /// Send a raw binary frame.
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        let frame = self.codec.encode_binary(data)?;
        self.write(Bytes::from(frame)).await
    }

    /// Reply to request `id` with a JSON result.
    pub async fn respond<T: Serialize>(&self, id: u64, result: &T) -> Result<()> {
        let frame = self.codec.encode_response(id, result)?;
        self.write(Bytes::from(frame)).await
    }

    /// Reply to request `id` with an error.
    pub async fn respond_error<T: Serialize>(&self, id: u64, error: &T) -> Result<()> {
        let frame = self.codec.encode_error(id, error)?;
        self.write(Bytes::from(frame)).await
    }

    /// Reply to request `id` with binary data: a checksum promise followed
    /// by the data frame.
    pub async fn respond_binary(&self, id: u64, data: &[u8]) -> Result<()> {
        let promise = self.codec.encode_promise(id, &Checksum::of(data))?;
        let binary = self.codec.encode_binary(data)?;
        self.write(Bytes::from(promise)).await?;
        self.write(Bytes::from(binary)).await
    }

    /// Registry shared with the read loop.
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    async fn write(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| LinkError::ConnectionClosed)
    }
}

/// A running connection.
///
/// Unrouted envelopes (application events and inbound requests) are read
/// with [`next_event`](Self::next_event). The queue is bounded; a consumer
/// that never drains it eventually stalls the read loop.
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::Receiver<Envelope>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl Connection {
    /// Split `io`, spawn the read loop and writer task, and return the
    /// running connection. Must be called within a tokio runtime.
    pub fn spawn<S>(io: S, link: Link) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (event_tx, events) = mpsc::channel(DEFAULT_EVENT_CAPACITY);

        let handle = ConnectionHandle {
            tx,
            codec: link.codec(),
            registry: link.registry().clone(),
            default_timeout: link.default_timeout(),
        };

        let writer_registry = link.registry().clone();
        let writer_task = tokio::spawn(async move {
            let result = writer_loop(rx, writer).await;
            if let Err(e) = &result {
                tracing::error!("Writer error: {}", e);
                writer_registry.close("write failed");
            }
            result
        });

        let registry = link.registry().clone();
        let reader_task = tokio::spawn(async move {
            if let Err(e) = read_loop(reader, link, event_tx).await {
                tracing::error!("Read loop error: {}", e);
            }
            registry.close("connection closed");
        });

        Self {
            handle,
            events,
            reader_task,
            writer_task,
        }
    }

    /// Get a handle for sending.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Next unrouted envelope, or `None` once the read side has ended.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    /// Wait for the read side to end, then stop the writer.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let Connection {
            handle,
            events,
            reader_task,
            writer_task,
        } = self;
        drop(events);
        if let Err(e) = reader_task.await {
            tracing::error!("Read task failed: {}", e);
        }
        drop(handle);

        // Errors from a finished writer were already logged by the task.
        if writer_task.is_finished() {
            if let Err(e) = writer_task.await {
                tracing::error!("Writer task failed: {}", e);
            }
        } else {
            writer_task.abort();
        }
        Ok(())
    }
}

/// Read chunks and feed them through the link until EOF.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    mut link: Link,
    events: mpsc::Sender<Envelope>,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Connection closed
            Ok(n) => n,
            Err(e) => return Err(LinkError::Io(e)),
        };

        for envelope in link.on_frame(&buf[..n]) {
            if events.send(envelope).await.is_err() {
                tracing::debug!("event receiver dropped, discarding envelope");
            }
        }
    }
}

/// Write queued frames, flushing once per batch.
async fn writer_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
) -> Result<()> {
    while let Some(first) = rx.recv().await {
        writer.write_all(&first).await?;

        let mut batched = 1;
        while batched < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    writer.write_all(&frame).await?;
                    batched += 1;
                }
                Err(_) => break,
            }
        }

        writer.flush().await?;
    }
    // Channel closed, clean shutdown
    writer.shutdown().await?;
    Ok(())
}
