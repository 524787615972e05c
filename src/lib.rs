//! # wirelink
//!
//! Connection core of a document-database driver speaking the legacy
//! request/reply wire protocol.
//!
//! This crate turns outbound message fragments into bytes on a stream and
//! the matching reply bytes back into a decoded header plus body buffer.
//!
//! ## Architecture
//!
//! - **Protocol**: 16-byte message header and 36-byte `OP_REPLY` header codec
//! - **Buffers**: pooled, move-only byte buffers shared across connections
//! - **Connection**: one half-duplex exchange at a time, with blocking and
//!   future-based flavours over the same state
//! - **Testing**: an interaction-queue connection for deterministic tests
//!
//! ## Example
//!
//! ```ignore
//! use wirelink::description::{ServerAddress, ServerId};
//! use wirelink::protocol::{build_message, next_request_id, OpCode};
//! use wirelink::transport::TcpStreamFactory;
//! use wirelink::{ConnectionDescription, InternalConnection, StreamConnection};
//!
//! #[tokio::main]
//! async fn main() -> wirelink::Result<()> {
//!     let server = ServerId::new("cluster", ServerAddress::new("db.local", 27017));
//!     let mut conn = StreamConnection::builder(
//!         ConnectionDescription::new(server),
//!         TcpStreamFactory::new(),
//!     )
//!     .build()?;
//!
//!     conn.open_async().await?;
//!     let id = next_request_id();
//!     let request = build_message(conn.buffer_provider(), OpCode::Query, id, 0, &query)?;
//!     conn.send_message_async(vec![request], id).await?;
//!     let mut reply = conn.receive_message_async(id).await?;
//!     println!("{} body bytes", reply.body_len()?);
//!     reply.release()?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod connection;
pub mod description;
pub mod error;
pub mod protocol;
pub mod testing;
pub mod transport;

mod response;

pub use buffer::{BufferProvider, PooledBuffer, PowerOfTwoBufferPool, SimpleBufferProvider};
pub use connection::{
    CloseHandle, Completion, ConnectionSettings, ConnectionState, InternalConnection,
    StreamConnection, StreamConnectionBuilder,
};
pub use description::ConnectionDescription;
pub use error::{ExchangeFailure, Result, WireError};
pub use response::ResponseBuffers;
