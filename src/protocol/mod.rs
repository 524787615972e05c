//! Protocol module - wire format and outbound message assembly.
//!
//! This module implements the binary framing of the connection:
//! - 16-byte message header and 36-byte reply header encoding/decoding
//! - Request id generation
//! - Fragment concatenation and message tiling checks

mod message;
mod wire_format;

pub use message::{build_message, combine_fragments, next_request_id, validate_message_tiling};
pub use wire_format::{
    decode_header, encode_reply_header, flags, MessageHeader, OpCode, ReplyHeader,
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, REPLY_HEADER_SIZE,
};
