//! Connection over a tokio byte stream.
//!
//! # Architecture
//!
//! ```text
//! blocking caller ──► runtime.block_on ─┐
//!                                       ├─► Inner (status + stream) ─► Stream
//! async caller ─► Completion::spawn ────┘
//! ```
//!
//! The blocking API drives the same async operations to completion on the
//! connection's runtime handle, so it must not be used from inside an async
//! context. Any transport failure, malformed reply or misdirected reply
//! closes the connection: the stream is no longer in a known position.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::{Completion, ConnectionSettings, InternalConnection};
use crate::buffer::{BufferProvider, PooledBuffer, PowerOfTwoBufferPool};
use crate::description::ConnectionDescription;
use crate::error::{ExchangeFailure, Result, WireError};
use crate::protocol::{combine_fragments, validate_message_tiling, ReplyHeader, REPLY_HEADER_SIZE};
use crate::response::ResponseBuffers;
use crate::transport::{Stream, StreamFactory};

/// Progress of the single exchange a connection may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Exchange {
    #[default]
    Idle,
    Sending(i32),
    AwaitingReply(i32),
    Receiving(i32),
}

#[derive(Debug, Default)]
struct Status {
    opened: bool,
    closed: bool,
    exchange: Exchange,
}

struct Inner<F: StreamFactory> {
    description: Arc<ConnectionDescription>,
    settings: ConnectionSettings,
    factory: F,
    provider: Arc<dyn BufferProvider>,
    status: Mutex<Status>,
    stream: tokio::sync::Mutex<Option<F::Stream>>,
    closed_tx: watch::Sender<bool>,
}

impl<F: StreamFactory> Inner<F> {
    async fn open(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            if status.closed {
                return Err(WireError::Protocol(
                    "cannot reopen a closed connection".to_string(),
                ));
            }
            if status.opened {
                return Err(WireError::Protocol("connection already opened".to_string()));
            }
            status.opened = true;
        }

        let address = self.description.server_address();
        tracing::debug!(connection = %self.description.connection_id, "Opening connection");

        let created = tokio::time::timeout(self.settings.connect_timeout, self.factory.create(address)).await;
        let stream = match created {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(connection = %self.description.connection_id, "Open failed: {}", e);
                self.close();
                return Err(WireError::Connection(e));
            }
            Err(_) => {
                tracing::warn!(connection = %self.description.connection_id, "Open timed out");
                self.close();
                return Err(WireError::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out establishing the stream",
                )));
            }
        };

        *self.stream.lock().await = Some(stream);

        let closed = self.status.lock().closed;
        if closed {
            self.stream.lock().await.take();
            return Err(WireError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "closed while opening",
            )));
        }
        Ok(())
    }

    fn close(&self) {
        let was_closed = std::mem::replace(&mut self.status.lock().closed, true);
        if was_closed {
            return;
        }
        self.closed_tx.send_replace(true);
        // A receive in progress holds the stream; it drops it when it wakes.
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
        tracing::debug!(connection = %self.description.connection_id, "Connection closed");
    }

    fn is_closed(&self) -> bool {
        self.status.lock().closed
    }

    fn begin_send(&self, last_request_id: i32) -> Result<()> {
        let mut status = self.status.lock();
        if status.closed {
            return Err(WireError::Send(ExchangeFailure::Closed));
        }
        if !status.opened {
            return Err(WireError::Send(ExchangeFailure::NotOpen));
        }
        if status.exchange != Exchange::Idle {
            return Err(WireError::Protocol(format!(
                "cannot send request {} while exchange {:?} is in progress",
                last_request_id, status.exchange
            )));
        }
        status.exchange = Exchange::Sending(last_request_id);
        Ok(())
    }

    fn finish_send(&self, last_request_id: i32, sent: bool) {
        self.status.lock().exchange = if sent {
            Exchange::AwaitingReply(last_request_id)
        } else {
            Exchange::Idle
        };
    }

    async fn send_message(&self, fragments: Vec<PooledBuffer>, last_request_id: i32) -> Result<()> {
        self.begin_send(last_request_id)?;
        let result = self.write_message(fragments, last_request_id).await;
        self.finish_send(last_request_id, result.is_ok());
        result
    }

    async fn write_message(&self, fragments: Vec<PooledBuffer>, last_request_id: i32) -> Result<()> {
        let combined = combine_fragments(self.provider.as_ref(), fragments)?;
        if self.settings.validate_outbound {
            validate_message_tiling(&combined, last_request_id, self.description.max_message_size)?;
        }

        let closed_rx = self.closed_tx.subscribe();
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(WireError::Send(ExchangeFailure::Closed));
        };

        let write = async {
            stream.write_all(&combined).await?;
            stream.flush().await
        };
        let written = tokio::select! {
            written = within(
                self.settings.write_timeout,
                async { write.await.map_err(|e| WireError::Send(e.into())) },
                || WireError::Send(ExchangeFailure::TimedOut),
            ) => written,
            _ = closed(closed_rx) => Err(WireError::Send(ExchangeFailure::Closed)),
        };

        match written {
            Ok(()) => {
                tracing::trace!(
                    connection = %self.description.connection_id,
                    request_id = last_request_id,
                    bytes = combined.len(),
                    "Sent message"
                );
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                tracing::warn!(connection = %self.description.connection_id, "Send failed: {}", e);
                self.close();
                Err(e)
            }
        }
    }

    fn begin_receive(&self, response_to: i32) -> Result<()> {
        let mut status = self.status.lock();
        match status.exchange {
            Exchange::AwaitingReply(id) if id == response_to => {
                status.exchange = Exchange::Receiving(id);
                Ok(())
            }
            Exchange::AwaitingReply(id) => Err(WireError::Protocol(format!(
                "receive for request {} but the pending request is {}",
                response_to, id
            ))),
            Exchange::Idle => Err(WireError::Protocol(format!(
                "receive for request {} with no pending exchange",
                response_to
            ))),
            Exchange::Sending(id) => Err(WireError::Protocol(format!(
                "receive before the send of request {} completed",
                id
            ))),
            Exchange::Receiving(id) => Err(WireError::Protocol(format!(
                "a receive for request {} is already in progress",
                id
            ))),
        }
    }

    async fn receive_message(&self, response_to: i32) -> Result<ResponseBuffers> {
        self.begin_receive(response_to)?;
        let result = self.read_reply(response_to).await;
        self.status.lock().exchange = Exchange::Idle;
        result
    }

    async fn read_reply(&self, response_to: i32) -> Result<ResponseBuffers> {
        let closed_rx = self.closed_tx.subscribe();
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(WireError::Receive(ExchangeFailure::Closed));
        };

        let read = read_reply_from(
            stream,
            self.provider.as_ref(),
            self.description.max_message_size,
        );
        let outcome = tokio::select! {
            outcome = within(
                self.settings.read_timeout,
                read,
                || WireError::Receive(ExchangeFailure::TimedOut),
            ) => outcome,
            _ = closed(closed_rx) => {
                Err(WireError::Receive(ExchangeFailure::Closed))
            }
        };

        let outcome = outcome.and_then(|reply| {
            let actual = reply.reply_header().response_to();
            if actual == response_to {
                Ok(reply)
            } else {
                Err(WireError::Receive(ExchangeFailure::ResponseToMismatch {
                    expected: response_to,
                    actual,
                }))
            }
        });

        match outcome {
            Ok(reply) => {
                tracing::trace!(
                    connection = %self.description.connection_id,
                    response_to,
                    bytes = reply.reply_header().message_length(),
                    "Received reply"
                );
                Ok(reply)
            }
            Err(e) => {
                guard.take();
                drop(guard);
                tracing::warn!(connection = %self.description.connection_id, "Receive failed: {}", e);
                self.close();
                Err(e)
            }
        }
    }
}

/// Read one reply header and its body.
async fn read_reply_from<S: Stream>(
    stream: &mut S,
    provider: &dyn BufferProvider,
    max_message_size: i32,
) -> Result<ResponseBuffers> {
    let mut header_buf = provider.get_buffer(REPLY_HEADER_SIZE)?;
    header_buf.resize(REPLY_HEADER_SIZE);
    stream
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| WireError::Receive(e.into()))?;

    let header = ReplyHeader::decode(&header_buf, max_message_size).map_err(|e| {
        let detail = match e {
            WireError::MalformedHeader(detail) => detail,
            other => other.to_string(),
        };
        WireError::Receive(ExchangeFailure::MalformedHeader(detail))
    })?;
    header_buf.release();

    let body_len = header.body_len();
    let mut body = provider.get_buffer(body_len)?;
    body.resize(body_len);
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| WireError::Receive(e.into()))?;

    Ok(ResponseBuffers::new(header, body))
}

/// Resolves once the connection is marked closed.
async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Bound `operation` by `limit`, if any.
async fn within<T, Fut, E>(limit: Option<Duration>, operation: Fut, on_timeout: E) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
    E: FnOnce() -> WireError,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .unwrap_or_else(|_| Err(on_timeout())),
        None => operation.await,
    }
}

/// Closes a connection from any thread.
///
/// Obtained from [`StreamConnection::close_handle`]; cheaply cloneable.
#[derive(Clone)]
pub struct CloseHandle {
    target: Arc<dyn CloseTarget>,
}

impl CloseHandle {
    /// Close the connection. A receive in progress fails with
    /// `Receive(Closed)`.
    pub fn close(&self) {
        self.target.close();
    }

    pub fn is_closed(&self) -> bool {
        self.target.is_closed()
    }
}

trait CloseTarget: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<F: StreamFactory> CloseTarget for Inner<F> {
    fn close(&self) {
        Inner::close(self);
    }

    fn is_closed(&self) -> bool {
        Inner::is_closed(self)
    }
}

/// Builder for [`StreamConnection`].
pub struct StreamConnectionBuilder<F: StreamFactory> {
    description: ConnectionDescription,
    factory: F,
    provider: Option<Arc<dyn BufferProvider>>,
    settings: ConnectionSettings,
    runtime: Option<Handle>,
}

impl<F: StreamFactory> StreamConnectionBuilder<F> {
    /// Set the buffer provider. Default: a private [`PowerOfTwoBufferPool`].
    pub fn buffer_provider(mut self, provider: Arc<dyn BufferProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the connection settings.
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the runtime that runs I/O. Default: the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build an unopened connection.
    ///
    /// # Errors
    ///
    /// `Config` if no runtime was given and none is current.
    pub fn build(self) -> Result<StreamConnection<F>> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| WireError::Config(e.to_string()))?,
        };
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(PowerOfTwoBufferPool::new()));
        let (closed_tx, _) = watch::channel(false);

        Ok(StreamConnection {
            inner: Arc::new(Inner {
                description: Arc::new(self.description),
                settings: self.settings,
                factory: self.factory,
                provider,
                status: Mutex::new(Status::default()),
                stream: tokio::sync::Mutex::new(None),
                closed_tx,
            }),
            runtime,
        })
    }
}

/// [`InternalConnection`] over a stream produced by a [`StreamFactory`].
pub struct StreamConnection<F: StreamFactory> {
    inner: Arc<Inner<F>>,
    runtime: Handle,
}

impl<F: StreamFactory> StreamConnection<F> {
    /// Start building a connection described by `description`.
    pub fn builder(description: ConnectionDescription, factory: F) -> StreamConnectionBuilder<F> {
        StreamConnectionBuilder {
            description,
            factory,
            provider: None,
            settings: ConnectionSettings::default(),
            runtime: None,
        }
    }

    /// Shared handle to the description.
    pub fn shared_description(&self) -> Arc<ConnectionDescription> {
        self.inner.description.clone()
    }

    /// Handle that can close this connection from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        let target: Arc<dyn CloseTarget> = self.inner.clone();
        CloseHandle { target }
    }

    /// Provider used for outbound and reply buffers.
    pub fn buffer_provider(&self) -> &dyn BufferProvider {
        self.inner.provider.as_ref()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }
}

impl<F: StreamFactory> InternalConnection for StreamConnection<F> {
    fn description(&self) -> &ConnectionDescription {
        &self.inner.description
    }

    fn open(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.open())
    }

    fn open_async(&mut self) -> Completion<()> {
        let inner = self.inner.clone();
        Completion::spawn(&self.runtime, async move { inner.open().await })
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn opened(&self) -> bool {
        self.inner.status.lock().opened
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn send_message(&mut self, fragments: Vec<PooledBuffer>, last_request_id: i32) -> Result<()> {
        self.runtime
            .block_on(self.inner.send_message(fragments, last_request_id))
    }

    fn receive_message(&mut self, response_to: i32) -> Result<ResponseBuffers> {
        self.runtime.block_on(self.inner.receive_message(response_to))
    }

    fn send_message_async(
        &mut self,
        fragments: Vec<PooledBuffer>,
        last_request_id: i32,
    ) -> Completion<()> {
        let inner = self.inner.clone();
        Completion::spawn(&self.runtime, async move {
            inner.send_message(fragments, last_request_id).await
        })
    }

    fn receive_message_async(&mut self, response_to: i32) -> Completion<ResponseBuffers> {
        let inner = self.inner.clone();
        Completion::spawn(&self.runtime, async move {
            inner.receive_message(response_to).await
        })
    }

    fn get_buffer(&self, size: usize) -> Result<PooledBuffer> {
        self.inner.provider.get_buffer(size)
    }
}

impl<F: StreamFactory> Drop for StreamConnection<F> {
    fn drop(&mut self) {
        self.inner.close();
    }
}
