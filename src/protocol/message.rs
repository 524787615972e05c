//! Outbound message assembly.
//!
//! A request reaches the connection as an ordered list of buffer fragments
//! plus the id of the last request they contain. Several wire messages may
//! travel in one send (for example a write followed by its acknowledgement
//! query), so the fragments are combined first and then checked to tile
//! into whole messages.
//!
//! # Example
//!
//! ```
//! use wirelink::buffer::SimpleBufferProvider;
//! use wirelink::protocol::{build_message, combine_fragments, OpCode, HEADER_SIZE};
//!
//! let provider = SimpleBufferProvider::new();
//! let msg = build_message(&provider, OpCode::Query, 7, 0, b"body").unwrap();
//! assert_eq!(msg.len(), HEADER_SIZE + 4);
//!
//! let combined = combine_fragments(&provider, vec![msg]).unwrap();
//! assert_eq!(combined.len(), HEADER_SIZE + 4);
//! ```

use std::sync::atomic::{AtomicI32, Ordering};

use super::wire_format::{MessageHeader, OpCode, HEADER_SIZE};
use crate::buffer::{BufferProvider, PooledBuffer};
use crate::error::{Result, WireError};

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Next process-wide request id. Wraps on overflow.
#[inline]
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Frame `body` as a single message in a buffer from `provider`.
pub fn build_message(
    provider: &dyn BufferProvider,
    op_code: OpCode,
    request_id: i32,
    response_to: i32,
    body: &[u8],
) -> Result<PooledBuffer> {
    let header = MessageHeader::for_body(body.len(), request_id, response_to, op_code)?;
    let mut buf = provider.get_buffer(HEADER_SIZE + body.len())?;
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Concatenate `fragments` in order into one buffer.
///
/// The result is sized to the sum of the fragment lengths. Fragments are
/// released back to their providers as they are copied. Whether the bytes
/// form valid messages is checked by [`validate_message_tiling`].
pub fn combine_fragments(
    provider: &dyn BufferProvider,
    fragments: Vec<PooledBuffer>,
) -> Result<PooledBuffer> {
    let total: usize = fragments.iter().map(|f| f.len()).sum();

    let mut combined = provider.get_buffer(total)?;
    for fragment in fragments {
        combined.extend_from_slice(&fragment);
        fragment.release();
    }

    debug_assert_eq!(combined.len(), total);
    Ok(combined)
}

/// Check that `bytes` is a run of whole messages ending with `last_request_id`.
///
/// Returns the number of messages found.
pub fn validate_message_tiling(
    bytes: &[u8],
    last_request_id: i32,
    max_message_size: i32,
) -> Result<usize> {
    let mut offset = 0;
    let mut count = 0;
    let mut last_id = None;

    while offset < bytes.len() {
        let header = MessageHeader::decode(&bytes[offset..], max_message_size)
            .map_err(|e| WireError::Protocol(format!("message {} at offset {}: {}", count, offset, e)))?;
        let end = offset + header.message_length as usize;
        if end > bytes.len() {
            return Err(WireError::Protocol(format!(
                "message at offset {} declares {} bytes but only {} remain",
                offset,
                header.message_length,
                bytes.len() - offset
            )));
        }
        last_id = Some(header.request_id);
        offset = end;
        count += 1;
    }

    match last_id {
        None => Err(WireError::Protocol("no message to send".to_string())),
        Some(id) if id != last_request_id => Err(WireError::Protocol(format!(
            "last message has request id {}, caller declared {}",
            id, last_request_id
        ))),
        Some(_) => Ok(count),
    }
}
