//! Error types for wirelink.
//!
//! Failures on a connection are attributed to the side of the exchange they
//! happened on: anything raised while writing a request surfaces as
//! [`WireError::Send`], anything raised while reading or decoding the reply
//! surfaces as [`WireError::Receive`]. Upstream retry logic relies on that
//! split to decide whether a request may have reached the server.

use thiserror::Error;

/// Main error type for all connection operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// The transport could not be established.
    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// Writing the request failed. The request may or may not have reached
    /// the server.
    #[error("Send error: {0}")]
    Send(#[source] ExchangeFailure),

    /// The request was handed to the transport but the reply could not be
    /// obtained.
    #[error("Receive error: {0}")]
    Receive(#[source] ExchangeFailure),

    /// Invariant violation caused by the caller (driver bug).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Header bytes could not be decoded.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// The buffer provider could not supply a buffer.
    #[error("Could not allocate buffer of {requested} bytes")]
    Allocation { requested: usize },

    /// A response buffer was read or released after being released.
    #[error("Buffer used after release")]
    UseAfterRelease,

    /// The connection went away before a completion could be delivered.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Settings could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection was built with an unusable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Cause of a send-side or receive-side failure.
#[derive(Debug, Error)]
pub enum ExchangeFailure {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reply header did not decode.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The reply answers a different request.
    #[error("reply is for request {actual}, expected {expected}")]
    ResponseToMismatch { expected: i32, actual: i32 },

    /// The configured timeout elapsed.
    #[error("timed out")]
    TimedOut,

    /// The connection was closed before or during the operation.
    #[error("connection closed")]
    Closed,

    /// The connection was never opened.
    #[error("connection not open")]
    NotOpen,
}

impl WireError {
    /// True if the failure happened while writing to the transport.
    pub fn is_send_failure(&self) -> bool {
        matches!(self, WireError::Send(_))
    }

    /// True if the failure happened while reading from the transport.
    pub fn is_receive_failure(&self) -> bool {
        matches!(self, WireError::Receive(_))
    }

    /// Whether the request could have been (partially) seen by the server.
    ///
    /// Send failures are ambiguous unless the connection was never usable;
    /// receive failures always follow a completed write.
    pub fn may_have_reached_server(&self) -> bool {
        match self {
            WireError::Send(ExchangeFailure::NotOpen | ExchangeFailure::Closed) => false,
            WireError::Send(_) | WireError::Receive(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
