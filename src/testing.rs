//! Deterministic in-memory connection for protocol-layer tests.
//!
//! [`TestInternalConnection`] never touches a socket. Each logical exchange
//! consumes one queued [`Interaction`]: a canned reply, a failure raised by
//! the send, or a failure raised by the receive. Outbound bytes are kept in
//! a log so tests can assert on exactly what would have been written.
//!
//! ```
//! use wirelink::description::{ServerAddress, ServerId};
//! use wirelink::protocol::{build_message, OpCode, ReplyHeader};
//! use wirelink::testing::TestInternalConnection;
//! use wirelink::{InternalConnection, ResponseBuffers};
//!
//! let mut conn = TestInternalConnection::new(ServerId::new("test", ServerAddress::default()));
//! let canned = ReplyHeader::new(7, 0, 2, 0, 0, 0, 1).unwrap();
//! conn.enqueue_reply(ResponseBuffers::from_bytes(canned, b"ok"));
//!
//! let request = build_message(conn.buffer_provider(), OpCode::Query, 42, 0, b"q").unwrap();
//! conn.send_message(vec![request], 42).unwrap();
//!
//! let reply = conn.receive_message(42).unwrap();
//! assert_eq!(reply.reply_header().response_to(), 42);
//! assert_eq!(conn.sent().len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::{BufferProvider, PooledBuffer, SimpleBufferProvider};
use crate::connection::{Completion, InternalConnection};
use crate::description::{ConnectionDescription, ServerId};
use crate::error::{ExchangeFailure, Result, WireError};
use crate::protocol::combine_fragments;
use crate::response::ResponseBuffers;

/// One scripted exchange outcome.
#[derive(Debug)]
pub enum Interaction {
    /// The send succeeds and the receive returns this reply, re-targeted at
    /// the request id it answers.
    Reply(ResponseBuffers),
    /// The send fails with this error. Nothing is logged.
    SendFailure(WireError),
    /// The send succeeds and the receive fails with this error.
    ReceiveFailure(WireError),
}

/// [`InternalConnection`] driven by a FIFO of [`Interaction`]s.
#[derive(Debug)]
pub struct TestInternalConnection {
    description: ConnectionDescription,
    provider: Arc<dyn BufferProvider>,
    interactions: VecDeque<Interaction>,
    /// Request ids of sends still waiting for their receive, oldest first.
    outstanding: VecDeque<i32>,
    sent: Vec<Bytes>,
    opened: bool,
    closed: bool,
}

impl TestInternalConnection {
    pub fn new(server_id: ServerId) -> Self {
        Self::with_description(ConnectionDescription::new(server_id))
    }

    pub fn with_description(description: ConnectionDescription) -> Self {
        Self {
            description,
            provider: Arc::new(SimpleBufferProvider::new()),
            interactions: VecDeque::new(),
            outstanding: VecDeque::new(),
            sent: Vec::new(),
            opened: false,
            closed: false,
        }
    }

    /// Use `provider` for fragments and combined messages.
    pub fn with_buffer_provider(mut self, provider: Arc<dyn BufferProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn buffer_provider(&self) -> &dyn BufferProvider {
        self.provider.as_ref()
    }

    pub fn enqueue(&mut self, interaction: Interaction) {
        self.interactions.push_back(interaction);
    }

    pub fn enqueue_reply(&mut self, reply: ResponseBuffers) {
        self.enqueue(Interaction::Reply(reply));
    }

    pub fn enqueue_send_failure(&mut self, error: WireError) {
        self.enqueue(Interaction::SendFailure(error));
    }

    pub fn enqueue_receive_failure(&mut self, error: WireError) {
        self.enqueue(Interaction::ReceiveFailure(error));
    }

    /// Every combined outbound message, in send order.
    pub fn sent(&self) -> &[Bytes] {
        &self.sent
    }

    /// Interactions not yet consumed.
    pub fn pending_interactions(&self) -> usize {
        self.interactions.len()
    }
}

impl InternalConnection for TestInternalConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    fn open(&mut self) -> Result<()> {
        if self.opened || self.closed {
            return Err(WireError::Protocol("connection already opened".to_string()));
        }
        self.opened = true;
        Ok(())
    }

    fn open_async(&mut self) -> Completion<()> {
        Completion::ready(self.open())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn opened(&self) -> bool {
        self.opened
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn send_message(&mut self, fragments: Vec<PooledBuffer>, last_request_id: i32) -> Result<()> {
        if self.closed {
            return Err(WireError::Send(ExchangeFailure::Closed));
        }

        // Sends may run ahead of receives; this send scripts the interaction
        // after the ones already claimed by earlier sends.
        let slot = self.outstanding.len();
        match self.interactions.get(slot) {
            None => {
                return Err(WireError::Protocol(format!(
                    "no interaction queued for request {}",
                    last_request_id
                )))
            }
            Some(Interaction::SendFailure(_)) => {
                return match self.interactions.remove(slot) {
                    Some(Interaction::SendFailure(error)) => Err(error),
                    _ => Err(WireError::Protocol("interaction queue changed".to_string())),
                };
            }
            Some(Interaction::Reply(_) | Interaction::ReceiveFailure(_)) => {}
        }

        let combined = combine_fragments(self.provider.as_ref(), fragments)?;
        self.sent.push(Bytes::from(combined.into_vec()));
        self.outstanding.push_back(last_request_id);
        Ok(())
    }

    fn receive_message(&mut self, response_to: i32) -> Result<ResponseBuffers> {
        if self.closed {
            return Err(WireError::Receive(ExchangeFailure::Closed));
        }
        if self.interactions.is_empty() {
            return Err(WireError::Protocol(
                "too many calls to receive_message".to_string(),
            ));
        }

        // Nothing is consumed unless the receive answers the oldest send.
        match self.outstanding.front() {
            None => {
                return Err(WireError::Protocol(format!(
                    "receive for request {} with no pending exchange",
                    response_to
                )))
            }
            Some(&pending) if pending != response_to => {
                return Err(WireError::Protocol(format!(
                    "receive for request {} but the pending request is {}",
                    response_to, pending
                )))
            }
            Some(_) => {}
        }

        match self.interactions.pop_front() {
            None => Err(WireError::Protocol(
                "too many calls to receive_message".to_string(),
            )),
            Some(Interaction::Reply(reply)) => {
                self.outstanding.pop_front();
                Ok(reply.retarget(response_to))
            }
            Some(Interaction::ReceiveFailure(error)) => {
                self.outstanding.pop_front();
                Err(error)
            }
            Some(failure @ Interaction::SendFailure(_)) => {
                self.interactions.push_front(failure);
                Err(WireError::Protocol(
                    "receive_message before the scripted send failure was raised".to_string(),
                ))
            }
        }
    }

    fn send_message_async(
        &mut self,
        fragments: Vec<PooledBuffer>,
        last_request_id: i32,
    ) -> Completion<()> {
        Completion::ready(self.send_message(fragments, last_request_id))
    }

    fn receive_message_async(&mut self, response_to: i32) -> Completion<ResponseBuffers> {
        Completion::ready(self.receive_message(response_to))
    }

    fn get_buffer(&self, size: usize) -> Result<PooledBuffer> {
        self.provider.get_buffer(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PowerOfTwoBufferPool;
    use crate::description::ServerAddress;
    use crate::protocol::{build_message, OpCode, ReplyHeader};

    fn connection() -> TestInternalConnection {
        TestInternalConnection::new(ServerId::new("test", ServerAddress::default()))
    }

    fn reply(request_id: i32, body: &[u8]) -> ResponseBuffers {
        ResponseBuffers::from_bytes(ReplyHeader::new(request_id, 0, body.len(), 0, 0, 0, 1).unwrap(), body)
    }

    fn message(conn: &TestInternalConnection, id: i32) -> Vec<PooledBuffer> {
        vec![build_message(conn.buffer_provider(), OpCode::Query, id, 0, b"doc").unwrap()]
    }

    #[test]
    fn test_reply_is_retargeted_to_sent_request() {
        let mut conn = connection();
        conn.enqueue_reply(reply(7, b"body"));

        conn.send_message(message(&conn, 42), 42).unwrap();
        let reply = conn.receive_message(42).unwrap();

        assert_eq!(reply.reply_header().response_to(), 42);
        assert_eq!(reply.reply_header().request_id(), 7);
        assert_eq!(reply.body().unwrap(), b"body");
    }

    #[test]
    fn test_exchanges_are_fifo() {
        let mut conn = connection();
        for i in 0..3 {
            conn.enqueue_reply(reply(100 + i, format!("reply-{}", i).as_bytes()));
        }

        for id in 1..=3 {
            conn.send_message(message(&conn, id), id).unwrap();
        }
        for (i, id) in (1..=3).enumerate() {
            let reply = conn.receive_message(id).unwrap();
            assert_eq!(reply.reply_header().response_to(), id);
            assert_eq!(reply.body().unwrap(), format!("reply-{}", i).as_bytes());
        }

        let err = conn.receive_message(4).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert_eq!(conn.sent().len(), 3);
    }

    #[test]
    fn test_send_failure_is_raised_and_not_logged() {
        let mut conn = connection();
        conn.enqueue_send_failure(WireError::Send(ExchangeFailure::TimedOut));

        let err = conn.send_message(message(&conn, 1), 1).unwrap_err();
        assert!(matches!(err, WireError::Send(ExchangeFailure::TimedOut)));
        assert!(conn.sent().is_empty());
        assert_eq!(conn.pending_interactions(), 0);
    }

    #[test]
    fn test_receive_failure_is_consumed() {
        let mut conn = connection();
        conn.enqueue_receive_failure(WireError::Receive(ExchangeFailure::Closed));
        conn.enqueue_reply(reply(2, b""));

        conn.send_message(message(&conn, 1), 1).unwrap();
        assert_eq!(conn.sent().len(), 1);

        let err = conn.receive_message(1).unwrap_err();
        assert!(matches!(err, WireError::Receive(ExchangeFailure::Closed)));

        conn.send_message(message(&conn, 2), 2).unwrap();
        let reply = conn.receive_message(2).unwrap();
        assert_eq!(reply.reply_header().response_to(), 2);
    }

    #[test]
    fn test_receive_does_not_skip_send_failure() {
        let mut conn = connection();
        conn.enqueue_send_failure(WireError::Send(ExchangeFailure::NotOpen));

        let err = conn.receive_message(1).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert_eq!(conn.pending_interactions(), 1);
    }

    #[test]
    fn test_receive_for_other_request_is_rejected() {
        let mut conn = connection();
        conn.enqueue_reply(reply(7, b"kept"));
        conn.send_message(message(&conn, 42), 42).unwrap();

        let err = conn.receive_message(99).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert_eq!(conn.pending_interactions(), 1);

        let reply = conn.receive_message(42).unwrap();
        assert_eq!(reply.reply_header().response_to(), 42);
        assert_eq!(reply.body().unwrap(), b"kept");
    }

    #[test]
    fn test_receive_without_send_is_rejected() {
        let mut conn = connection();
        conn.enqueue_reply(reply(7, b""));

        let err = conn.receive_message(5).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert_eq!(conn.pending_interactions(), 1);

        conn.send_message(message(&conn, 5), 5).unwrap();
        let reply = conn.receive_message(5).unwrap();
        assert_eq!(reply.reply_header().response_to(), 5);
    }

    #[test]
    fn test_fragments_logged_as_one_unit() {
        let mut conn = connection();
        conn.enqueue_reply(reply(1, b""));

        let first = PooledBuffer::copy_from_slice(&[1, 2, 3]);
        let second = PooledBuffer::copy_from_slice(&[4, 5, 6, 7, 8]);
        conn.send_message(vec![first, second], 9).unwrap();

        assert_eq!(conn.sent().len(), 1);
        assert_eq!(&conn.sent()[0][..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_send_with_empty_queue() {
        let mut conn = connection();
        let err = conn.send_message(message(&conn, 1), 1).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = connection();
        conn.open().unwrap();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.opened());

        let err = conn.send_message(message(&conn, 1), 1).unwrap_err();
        assert!(matches!(err, WireError::Send(ExchangeFailure::Closed)));
    }

    #[test]
    fn test_pooled_provider_gets_fragments_back() {
        let pool = PowerOfTwoBufferPool::new();
        let mut conn = connection().with_buffer_provider(Arc::new(pool.clone()));
        conn.enqueue_reply(reply(1, b""));

        let fragment = conn.get_buffer(32).unwrap();
        conn.send_message(vec![fragment], 1).unwrap();

        assert!(pool.stats().recycled >= 1);
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let mut conn = connection();
        conn.enqueue_reply(reply(7, b"a"));
        conn.enqueue_send_failure(WireError::Send(ExchangeFailure::TimedOut));

        conn.send_message_async(message(&conn, 42), 42).await.unwrap();
        let reply = conn.receive_message_async(42).await.unwrap();
        assert_eq!(reply.reply_header().response_to(), 42);

        let err = conn.send_message_async(message(&conn, 43), 43).await.unwrap_err();
        assert!(matches!(err, WireError::Send(ExchangeFailure::TimedOut)));

        let err = conn.receive_message_async(43).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }
}
