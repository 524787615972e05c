//! Wire format encoding and decoding.
//!
//! Implements the 16-byte message header:
//! ```text
//! ┌──────────────┬────────────┬────────────┬──────────┐
//! │ Msg Length   │ Request ID │ Response To│ Op Code  │
//! │ 4 bytes      │ 4 bytes    │ 4 bytes    │ 4 bytes  │
//! │ int32 LE     │ int32 LE   │ int32 LE   │ int32 LE │
//! └──────────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! Replies (`OP_REPLY`) extend it to 36 bytes:
//! ```text
//! ┌──────────────┬────────────┬──────────────┬────────────────┐
//! │ Resp. Flags  │ Cursor ID  │ Starting From│ Number Returned│
//! │ int32 LE     │ int64 LE   │ int32 LE     │ int32 LE       │
//! └──────────────┴────────────┴──────────────┴────────────────┘
//! ```
//!
//! All integers are signed and Little Endian, whatever the host byte order.

use bytes::{Buf, BufMut};

use crate::error::{Result, WireError};

/// Message header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Reply header size in bytes (message header + reply fields).
pub const REPLY_HEADER_SIZE: usize = 36;

/// Default maximum message size (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 0x200_0000;

/// Response flag constants for `OP_REPLY`.
pub mod flags {
    /// getMore was issued for a cursor the server no longer knows.
    pub const CURSOR_NOT_FOUND: i32 = 0b0001;
    /// The query failed; the body holds a single error document.
    pub const QUERY_FAILURE: i32 = 0b0010;
    /// Shard configuration is stale.
    pub const SHARD_CONFIG_STALE: i32 = 0b0100;
    /// Server supports the await-data query option.
    pub const AWAIT_CAPABLE: i32 = 0b1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: i32, flag: i32) -> bool {
        flags & flag != 0
    }
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Msg,
    /// Any value this crate does not interpret, preserved as-is.
    Other(i32),
}

impl OpCode {
    pub fn from_value(value: i32) -> Self {
        match value {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2013 => OpCode::Msg,
            other => OpCode::Other(other),
        }
    }

    pub fn value(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Msg => 2013,
            OpCode::Other(value) => value,
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length in bytes, header included.
    pub message_length: i32,
    /// Identifier chosen by the sender.
    pub request_id: i32,
    /// Request id this message answers (0 for requests).
    pub response_to: i32,
    /// Message type.
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Create a new header.
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            message_length,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Header for a message carrying `body_len` bytes after the header.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` if the total length does not fit the length field.
    pub fn for_body(
        body_len: usize,
        request_id: i32,
        response_to: i32,
        op_code: OpCode,
    ) -> Result<Self> {
        Ok(Self::new(
            message_length(HEADER_SIZE, body_len)?,
            request_id,
            response_to,
            op_code,
        ))
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use wirelink::protocol::{MessageHeader, OpCode};
    ///
    /// let header = MessageHeader::new(26, 42, 0, OpCode::Query);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[0..4], &[26, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        let mut out = &mut buf[..HEADER_SIZE];
        out.put_i32_le(self.message_length);
        out.put_i32_le(self.request_id);
        out.put_i32_le(self.response_to);
        out.put_i32_le(self.op_code.value());
    }

    /// Decode a header without any length validation.
    ///
    /// Returns `None` if buffer is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut cur = &buf[..HEADER_SIZE];
        Some(Self {
            message_length: cur.get_i32_le(),
            request_id: cur.get_i32_le(),
            response_to: cur.get_i32_le(),
            op_code: OpCode::from_value(cur.get_i32_le()),
        })
    }

    /// Decode and validate a header.
    ///
    /// Fails with `MalformedHeader` if fewer than 16 bytes are available or
    /// the declared length is outside `HEADER_SIZE..=max_message_size`.
    pub fn decode(buf: &[u8], max_message_size: i32) -> Result<Self> {
        let header = Self::parse(buf).ok_or_else(|| {
            WireError::MalformedHeader(format!(
                "need {} header bytes, got {}",
                HEADER_SIZE,
                buf.len()
            ))
        })?;
        header.validate(max_message_size)?;
        Ok(header)
    }

    /// Validate the declared message length.
    pub fn validate(&self, max_message_size: i32) -> Result<()> {
        if self.message_length < HEADER_SIZE as i32 {
            return Err(WireError::MalformedHeader(format!(
                "message length {} is smaller than the header",
                self.message_length
            )));
        }

        if self.message_length > max_message_size {
            return Err(WireError::MalformedHeader(format!(
                "message length {} exceeds maximum {}",
                self.message_length, max_message_size
            )));
        }

        Ok(())
    }

    /// Number of bytes following the header.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Decoded `OP_REPLY` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Leading message header.
    pub header: MessageHeader,
    /// Bit vector, see [`flags`].
    pub response_flags: i32,
    /// Cursor to use for getMore, 0 if exhausted.
    pub cursor_id: i64,
    /// Position of the first returned document in the cursor.
    pub starting_from: i32,
    /// Number of documents in the body.
    pub number_returned: i32,
}

impl ReplyHeader {
    /// Create a reply header for a body of `body_len` bytes.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` if the total length does not fit the length field.
    pub fn new(
        request_id: i32,
        response_to: i32,
        body_len: usize,
        response_flags: i32,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
    ) -> Result<Self> {
        Ok(Self {
            header: MessageHeader::new(
                message_length(REPLY_HEADER_SIZE, body_len)?,
                request_id,
                response_to,
                OpCode::Reply,
            ),
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
        })
    }

    /// Encode the full 36-byte reply header.
    pub fn encode(&self) -> [u8; REPLY_HEADER_SIZE] {
        let mut buf = [0u8; REPLY_HEADER_SIZE];
        self.header.encode_into(&mut buf);
        let mut out = &mut buf[HEADER_SIZE..];
        out.put_i32_le(self.response_flags);
        out.put_i64_le(self.cursor_id);
        out.put_i32_le(self.starting_from);
        out.put_i32_le(self.number_returned);
        buf
    }

    /// Decode and validate a reply header.
    ///
    /// Besides the message header checks, the opcode must be `OP_REPLY`,
    /// the length must cover the reply fields and `number_returned` must
    /// not be negative. On failure nothing is consumed from `buf`.
    pub fn decode(buf: &[u8], max_message_size: i32) -> Result<Self> {
        if buf.len() < REPLY_HEADER_SIZE {
            return Err(WireError::MalformedHeader(format!(
                "need {} reply header bytes, got {}",
                REPLY_HEADER_SIZE,
                buf.len()
            )));
        }

        let header = MessageHeader::decode(buf, max_message_size)?;
        if header.op_code != OpCode::Reply {
            return Err(WireError::MalformedHeader(format!(
                "unexpected reply opcode {}",
                header.op_code.value()
            )));
        }
        if header.message_length < REPLY_HEADER_SIZE as i32 {
            return Err(WireError::MalformedHeader(format!(
                "reply length {} is smaller than the reply header",
                header.message_length
            )));
        }

        let mut cur = &buf[HEADER_SIZE..REPLY_HEADER_SIZE];
        let reply = Self {
            header,
            response_flags: cur.get_i32_le(),
            cursor_id: cur.get_i64_le(),
            starting_from: cur.get_i32_le(),
            number_returned: cur.get_i32_le(),
        };

        if reply.number_returned < 0 {
            return Err(WireError::MalformedHeader(format!(
                "negative number returned: {}",
                reply.number_returned
            )));
        }

        Ok(reply)
    }

    /// Copy of this header answering `response_to` instead.
    ///
    /// Goes through [`encode_reply_header`], so every other field is kept
    /// bit for bit.
    pub fn with_response_to(&self, response_to: i32) -> Self {
        let bytes = encode_reply_header(self, response_to);
        let mut cur = &bytes[..];
        Self {
            header: MessageHeader {
                message_length: cur.get_i32_le(),
                request_id: cur.get_i32_le(),
                response_to: cur.get_i32_le(),
                op_code: OpCode::from_value(cur.get_i32_le()),
            },
            response_flags: cur.get_i32_le(),
            cursor_id: cur.get_i64_le(),
            starting_from: cur.get_i32_le(),
            number_returned: cur.get_i32_le(),
        }
    }

    #[inline]
    pub fn request_id(&self) -> i32 {
        self.header.request_id
    }

    #[inline]
    pub fn response_to(&self) -> i32 {
        self.header.response_to
    }

    #[inline]
    pub fn message_length(&self) -> i32 {
        self.header.message_length
    }

    /// Number of body bytes following the reply header.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.header.message_length as usize).saturating_sub(REPLY_HEADER_SIZE)
    }

    #[inline]
    pub fn is_cursor_not_found(&self) -> bool {
        flags::has_flag(self.response_flags, flags::CURSOR_NOT_FOUND)
    }

    #[inline]
    pub fn is_query_failure(&self) -> bool {
        flags::has_flag(self.response_flags, flags::QUERY_FAILURE)
    }

    #[inline]
    pub fn is_shard_config_stale(&self) -> bool {
        flags::has_flag(self.response_flags, flags::SHARD_CONFIG_STALE)
    }

    #[inline]
    pub fn is_await_capable(&self) -> bool {
        flags::has_flag(self.response_flags, flags::AWAIT_CAPABLE)
    }
}

/// Decode a message header (standalone function).
#[inline]
pub fn decode_header(buf: &[u8], max_message_size: i32) -> Result<MessageHeader> {
    MessageHeader::decode(buf, max_message_size)
}

/// Encode a reply header answering `response_to`.
///
/// Only the response-to field differs from `header.encode()`. Used to point a
/// canned reply at whichever request it ends up answering; replies read from
/// a real server never go through here.
pub fn encode_reply_header(header: &ReplyHeader, response_to: i32) -> [u8; REPLY_HEADER_SIZE] {
    let mut bytes = header.encode();
    (&mut bytes[8..12]).put_i32_le(response_to);
    bytes
}

/// Total length of a message with a `header_size` header and `body_len` body.
fn message_length(header_size: usize, body_len: usize) -> Result<i32> {
    header_size
        .checked_add(body_len)
        .and_then(|total| i32::try_from(total).ok())
        .ok_or_else(|| {
            WireError::MalformedHeader(format!(
                "body of {} bytes does not fit in a message length",
                body_len
            ))
        })
}
