//! The internal connection contract.
//!
//! An [`InternalConnection`] is one physical connection to one server. It
//! carries at most one request/reply exchange at a time: a request is sent,
//! then its reply is received, then the next request may go out. Both a
//! blocking and a future-based flavour of every exchange operation are
//! available over the same connection state.
//!
//! # Example
//!
//! ```ignore
//! use wirelink::protocol::{build_message, next_request_id, OpCode};
//! use wirelink::InternalConnection;
//!
//! conn.open()?;
//! let id = next_request_id();
//! let msg = build_message(provider.as_ref(), OpCode::Query, id, 0, &query)?;
//! conn.send_message(vec![msg], id)?;
//! let mut reply = conn.receive_message(id)?;
//! handle(reply.body()?);
//! reply.release()?;
//! ```

mod completion;
mod settings;
mod stream;

pub use completion::Completion;
pub use settings::{ConnectionSettings, DEFAULT_CONNECT_TIMEOUT};
pub use stream::{CloseHandle, StreamConnection, StreamConnectionBuilder};

use crate::buffer::PooledBuffer;
use crate::description::ConnectionDescription;
use crate::error::Result;
use crate::response::ResponseBuffers;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Open,
    Closed,
}

/// One connection to one server.
pub trait InternalConnection: Send {
    /// Metadata fixed at construction.
    fn description(&self) -> &ConnectionDescription;

    /// Establish the transport. Must be called once.
    ///
    /// # Errors
    ///
    /// `Connection` if the transport cannot be established, `Protocol` if the
    /// connection was already opened or closed.
    fn open(&mut self) -> Result<()>;

    /// Future-based [`open`](Self::open).
    fn open_async(&mut self) -> Completion<()>;

    /// Release the transport. Idempotent; fails any receive in progress.
    fn close(&mut self);

    /// Whether `open` has been attempted.
    fn opened(&self) -> bool;

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.opened() {
            ConnectionState::Open
        } else {
            ConnectionState::Unopened
        }
    }

    /// Combine `fragments` in order and write them as one unit.
    ///
    /// `last_request_id` is the id of the last message in the fragments; the
    /// next receive must be for that id.
    ///
    /// # Errors
    ///
    /// `Send` if the connection is not open or the write fails, `Protocol`
    /// if an exchange is already in progress.
    fn send_message(&mut self, fragments: Vec<PooledBuffer>, last_request_id: i32) -> Result<()>;

    /// Read the reply to `response_to`.
    ///
    /// # Errors
    ///
    /// `Protocol` if no matching send precedes it, `Receive` if the read
    /// fails, the header is malformed, or the reply answers another request.
    fn receive_message(&mut self, response_to: i32) -> Result<ResponseBuffers>;

    /// Future-based [`send_message`](Self::send_message).
    fn send_message_async(
        &mut self,
        fragments: Vec<PooledBuffer>,
        last_request_id: i32,
    ) -> Completion<()>;

    /// Future-based [`receive_message`](Self::receive_message).
    fn receive_message_async(&mut self, response_to: i32) -> Completion<ResponseBuffers>;

    /// Buffer of at least `size` bytes capacity from the connection's provider.
    fn get_buffer(&self, size: usize) -> Result<PooledBuffer>;
}
