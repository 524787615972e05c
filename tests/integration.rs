//! Integration tests for wirelink.
//!
//! These tests drive full exchanges across module boundaries: codec, buffer
//! pool, stream connection over real TCP, and the scripted connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wirelink::description::{ServerAddress, ServerId};
use wirelink::protocol::{
    build_message, next_request_id, MessageHeader, OpCode, ReplyHeader, HEADER_SIZE,
};
use wirelink::testing::TestInternalConnection;
use wirelink::transport::TcpStreamFactory;
use wirelink::{
    BufferProvider, ConnectionDescription, ConnectionSettings, ConnectionState, ExchangeFailure,
    InternalConnection, PowerOfTwoBufferPool, ResponseBuffers, SimpleBufferProvider, StreamConnection,
    WireError,
};

/// Echo server: answers every request with its own body.
async fn serve_echo(mut socket: TcpStream) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let header = MessageHeader::parse(&header).unwrap();
        let mut body = vec![0u8; header.body_len()];
        socket.read_exact(&mut body).await.unwrap();

        let reply = ReplyHeader::new(next_request_id(), header.request_id, body.len(), 0, 0, 0, 1).unwrap();
        socket.write_all(&reply.encode()).await.unwrap();
        socket.write_all(&body).await.unwrap();
    }
}

async fn echo_server() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_echo(socket));
        }
    });
    ServerAddress::new("127.0.0.1", port)
}

fn description(address: ServerAddress) -> ConnectionDescription {
    ConnectionDescription::new(ServerId::new("integration", address))
}

#[tokio::test]
async fn test_exchanges_over_tcp() {
    let address = echo_server().await;
    let mut conn = StreamConnection::builder(description(address), TcpStreamFactory::new())
        .settings(ConnectionSettings::default().read_timeout(Duration::from_secs(5)))
        .build()
        .unwrap();

    conn.open_async().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);

    for i in 0..5 {
        let id = next_request_id();
        let body = format!("document-{}", i);
        let request = build_message(conn.buffer_provider(), OpCode::Query, id, 0, body.as_bytes())
            .unwrap();
        conn.send_message_async(vec![request], id).await.unwrap();

        let mut reply = conn.receive_message_async(id).await.unwrap();
        assert_eq!(reply.reply_header().response_to(), id);
        assert_eq!(reply.body().unwrap(), body.as_bytes());
        reply.release().unwrap();
        assert!(matches!(reply.release(), Err(WireError::UseAfterRelease)));
    }

    conn.close();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_multi_message_send_answers_last_request() {
    let address = echo_server().await;
    let mut conn = StreamConnection::builder(description(address), TcpStreamFactory::new())
        .build()
        .unwrap();
    conn.open_async().await.unwrap();

    // The echo server answers both messages; only the last reply is read
    // before the connection is closed.
    let first = next_request_id();
    let second = next_request_id();
    let provider = conn.buffer_provider();
    let fragments = vec![
        build_message(provider, OpCode::Insert, first, 0, b"one").unwrap(),
        build_message(provider, OpCode::Query, second, 0, b"two").unwrap(),
    ];
    conn.send_message_async(fragments, second).await.unwrap();

    let err = conn.receive_message_async(second).await.unwrap_err();
    assert!(matches!(
        err,
        WireError::Receive(ExchangeFailure::ResponseToMismatch { .. })
    ));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_shared_pool_across_connections() {
    let address = echo_server().await;
    let pool = PowerOfTwoBufferPool::new();
    let provider: Arc<dyn BufferProvider> = Arc::new(pool.clone());

    let mut handles = Vec::new();
    for n in 0..4 {
        let mut conn =
            StreamConnection::builder(description(address.clone()), TcpStreamFactory::new())
                .buffer_provider(provider.clone())
                .build()
                .unwrap();
        handles.push(tokio::spawn(async move {
            conn.open_async().await.unwrap();
            for _ in 0..10 {
                let id = next_request_id();
                let body = vec![n as u8; 100];
                let request =
                    build_message(conn.buffer_provider(), OpCode::Query, id, 0, &body).unwrap();
                conn.send_message_async(vec![request], id).await.unwrap();
                let reply = conn.receive_message_async(id).await.unwrap();
                assert_eq!(reply.body().unwrap(), &body[..]);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    assert!(stats.hits > 0);
    assert!(pool.idle_count() > 0);
}

#[tokio::test]
async fn test_open_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut conn = StreamConnection::builder(
        description(ServerAddress::new("127.0.0.1", port)),
        TcpStreamFactory::new(),
    )
    .build()
    .unwrap();

    let err = conn.open_async().await.unwrap_err();
    assert!(matches!(err, WireError::Connection(_)));
    assert!(conn.opened());
    assert!(conn.is_closed());

    let request = build_message(conn.buffer_provider(), OpCode::Query, 1, 0, b"").unwrap();
    let err = conn.send_message_async(vec![request], 1).await.unwrap_err();
    assert!(matches!(err, WireError::Send(ExchangeFailure::Closed)));
    assert!(!err.may_have_reached_server());
}

#[test]
fn test_close_handle_unblocks_blocking_receive() {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    // Server that reads the request and never answers.
    let (address, _server) = runtime.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });
        (ServerAddress::new("127.0.0.1", port), server)
    });

    let mut conn = StreamConnection::builder(description(address), TcpStreamFactory::new())
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
    conn.open().unwrap();

    let id = next_request_id();
    let request = build_message(conn.buffer_provider(), OpCode::Query, id, 0, b"wait").unwrap();
    conn.send_message(vec![request], id).unwrap();

    let closer = conn.close_handle();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        closer.close();
    });

    let err = conn.receive_message(id).unwrap_err();
    assert!(matches!(err, WireError::Receive(ExchangeFailure::Closed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    timer.join().unwrap();
}

/// Scripted and real connections are interchangeable behind the trait.
fn run_exchange(conn: &mut dyn InternalConnection, id: i32) -> wirelink::Result<ResponseBuffers> {
    let provider = SimpleBufferProvider::new();
    let request = build_message(&provider, OpCode::Query, id, 0, b"x")?;
    conn.send_message(vec![request], id)?;
    conn.receive_message(id)
}

#[test]
fn test_scripted_connection_behind_trait_object() {
    let mut conn = TestInternalConnection::new(ServerId::new("integration", ServerAddress::default()));
    let canned = ReplyHeader::new(7, 0, 3, 0, 0, 0, 1).unwrap();
    conn.enqueue_reply(ResponseBuffers::from_bytes(canned, b"abc"));
    conn.enqueue_receive_failure(WireError::Receive(ExchangeFailure::TimedOut));

    let reply = run_exchange(&mut conn, 42).unwrap();
    assert_eq!(reply.reply_header().response_to(), 42);
    assert_eq!(reply.body().unwrap(), b"abc");

    let err = run_exchange(&mut conn, 43).unwrap_err();
    assert!(matches!(err, WireError::Receive(ExchangeFailure::TimedOut)));

    let err = run_exchange(&mut conn, 44).unwrap_err();
    assert!(matches!(err, WireError::Protocol(_)));
    assert_eq!(conn.sent().len(), 2);
}

/// A receive must answer the pending send; anything else leaves the
/// exchange untouched.
fn check_receive_guards(conn: &mut dyn InternalConnection) {
    let err = conn.receive_message(10).unwrap_err();
    assert!(matches!(err, WireError::Protocol(_)));

    let provider = SimpleBufferProvider::new();
    let request = build_message(&provider, OpCode::Query, 10, 0, b"guard").unwrap();
    conn.send_message(vec![request], 10).unwrap();

    let err = conn.receive_message(11).unwrap_err();
    assert!(matches!(err, WireError::Protocol(_)));
    assert!(!conn.is_closed());

    let reply = conn.receive_message(10).unwrap();
    assert_eq!(reply.reply_header().response_to(), 10);
}

#[test]
fn test_receive_guards_hold_for_both_connections() {
    let mut scripted =
        TestInternalConnection::new(ServerId::new("integration", ServerAddress::default()));
    let canned = ReplyHeader::new(7, 0, 0, 0, 0, 0, 0).unwrap();
    scripted.enqueue_reply(ResponseBuffers::from_bytes(canned, b""));
    check_receive_guards(&mut scripted);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let address = runtime.block_on(echo_server());
    let mut real = StreamConnection::builder(description(address), TcpStreamFactory::new())
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
    real.open().unwrap();
    check_receive_guards(&mut real);
}
