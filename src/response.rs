//! Owned reply container.
//!
//! [`ResponseBuffers`] pairs a decoded [`ReplyHeader`] with the body bytes
//! read after it. The body lives in a [`PooledBuffer`] until the caller
//! releases it; after that every read fails with `UseAfterRelease`.
//!
//! # Example
//!
//! ```
//! use wirelink::protocol::ReplyHeader;
//! use wirelink::ResponseBuffers;
//!
//! let header = ReplyHeader::new(7, 42, 3, 0, 0, 0, 1).unwrap();
//! let mut reply = ResponseBuffers::from_bytes(header, b"doc");
//! assert_eq!(reply.body().unwrap(), b"doc");
//!
//! reply.release().unwrap();
//! assert!(reply.body().is_err());
//! ```

use crate::buffer::PooledBuffer;
use crate::error::{Result, WireError};
use crate::protocol::ReplyHeader;

/// A reply header and its body.
#[derive(Debug)]
pub struct ResponseBuffers {
    reply_header: ReplyHeader,
    body: Option<PooledBuffer>,
}

impl ResponseBuffers {
    /// Pair a header with a body buffer.
    pub fn new(reply_header: ReplyHeader, body: PooledBuffer) -> Self {
        Self {
            reply_header,
            body: Some(body),
        }
    }

    /// Build from a copied body. Intended for canned replies.
    pub fn from_bytes(reply_header: ReplyHeader, body: &[u8]) -> Self {
        Self::new(reply_header, PooledBuffer::copy_from_slice(body))
    }

    /// The decoded reply header. Stays readable after release.
    #[inline]
    pub fn reply_header(&self) -> &ReplyHeader {
        &self.reply_header
    }

    /// Body bytes following the reply header.
    pub fn body(&self) -> Result<&[u8]> {
        self.body.as_deref().ok_or(WireError::UseAfterRelease)
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> Result<usize> {
        self.body().map(<[u8]>::len)
    }

    /// Return the body buffer to its provider.
    ///
    /// # Errors
    ///
    /// `UseAfterRelease` if already released.
    pub fn release(&mut self) -> Result<()> {
        let body = self.body.take().ok_or(WireError::UseAfterRelease)?;
        body.release();
        Ok(())
    }

    /// Whether `release` has been called.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.body.is_none()
    }

    /// Same body, header re-targeted at `response_to`.
    ///
    /// Used by canned replies in test doubles; see
    /// [`encode_reply_header`](crate::protocol::encode_reply_header).
    pub fn retarget(self, response_to: i32) -> Self {
        Self {
            reply_header: self.reply_header.with_response_to(response_to),
            body: self.body,
        }
    }

    /// Split into header and body buffer.
    pub fn into_parts(mut self) -> Result<(ReplyHeader, PooledBuffer)> {
        let body = self.body.take().ok_or(WireError::UseAfterRelease)?;
        Ok((self.reply_header, body))
    }
}
