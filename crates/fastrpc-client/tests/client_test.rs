//! Client Integration Tests
//!
//! These tests attach a `FastClient` to one end of an in-memory duplex pipe
//! and play the server by hand on the other end, which lets them send
//! well-formed responses, out-of-order responses, garbage, or nothing.

use fastrpc_client::{
    ClientConfig, FastClient, FastRequestError, RecentOutcome, RequestFailure, RpcRequest,
};
use fastrpc_common::{
    encode_message, FastMessage, FastMessageDecoder, FastMessageEncoder, FastProtocolError,
    FastStatus, FastTransportError, RpcError,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// The server side of a duplex pipe, driven by the test.
struct MockServer {
    reader: FramedRead<ReadHalf<DuplexStream>, FastMessageDecoder>,
    writer: FramedWrite<WriteHalf<DuplexStream>, FastMessageEncoder>,
}

impl MockServer {
    async fn recv(&mut self) -> FastMessage {
        timeout(TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the connection")
            .unwrap()
    }

    async fn send(&mut self, msg: FastMessage) {
        self.writer.send(msg).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.get_mut().write_all(bytes).await.unwrap();
    }

    async fn expect_closed(&mut self) {
        let next = timeout(TIMEOUT, self.reader.next()).await.expect("timed out waiting for close");
        assert!(next.is_none(), "unexpected message: {next:?}");
    }
}

fn setup_with(config: ClientConfig) -> (FastClient, MockServer) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let client = FastClient::new(client_end, config);
    let (reader, writer) = tokio::io::split(server_end);
    let server = MockServer {
        reader: FramedRead::new(reader, FastMessageDecoder::new()),
        writer: FramedWrite::new(writer, FastMessageEncoder),
    };
    (client, server)
}

fn setup() -> (FastClient, MockServer) {
    setup_with(ClientConfig::default())
}

async fn finish(request: RpcRequest) -> Result<Vec<Value>, FastRequestError> {
    timeout(TIMEOUT, request.collect_items())
        .await
        .expect("timed out waiting for the request")
}

async fn next_item(request: &mut RpcRequest) -> Option<Result<Value, FastRequestError>> {
    timeout(TIMEOUT, request.next()).await.expect("timed out waiting for an item")
}

fn encoded(msg: &FastMessage) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    encode_message(msg, &mut buf).unwrap();
    buf.to_vec()
}

/// Transport whose reads block until `reset` fires and then fail, and
/// whose writes always succeed and are counted.
struct ResettableTransport {
    reset: oneshot::Receiver<()>,
    written: Arc<AtomicUsize>,
}

impl AsyncRead for ResettableTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().reset).poll(cx) {
            Poll::Ready(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for ResettableTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.fetch_add(buf.len(), Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// Successful requests
// ============================================================================

#[tokio::test]
async fn test_request_without_data() {
    let (client, mut server) = setup();

    let request = client.rpc("ping", vec![]);
    assert_eq!(request.request_id(), 1);
    assert_eq!(request.method_name(), "ping");

    let call = server.recv().await;
    assert_eq!(call.msgid, 1);
    assert_eq!(call.status, FastStatus::Data);
    assert_eq!(call.data, json!({"m": {"name": "ping"}, "d": []}));

    server.send(FastMessage::rpc_end(1, "ping")).await;
    assert_eq!(finish(request).await.unwrap(), Vec::<Value>::new());
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_items_across_data_and_end() {
    let (client, mut server) = setup();

    let request = client.rpc("list", vec![json!("arg1"), json!({"n": 2})]);
    let call = server.recv().await;
    assert_eq!(call.items(), Some(&vec![json!("arg1"), json!({"n": 2})]));

    server.send(FastMessage::rpc_data(call.msgid, "list", vec![json!("first")])).await;
    server.send(FastMessage::rpc_data(call.msgid, "list", vec![json!("second"), json!("third")])).await;
    server.send(FastMessage::new(call.msgid, FastStatus::End, json!({"d": ["last"]}))).await;

    let items = finish(request).await.unwrap();
    assert_eq!(items, vec![json!("first"), json!("second"), json!("third"), json!("last")]);

    let recent = client.recent_requests();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].method, "list");
    assert_eq!(recent[0].ndata, 2);
    assert_eq!(recent[0].outcome, RecentOutcome::Ended);
}

#[tokio::test]
async fn test_msgids_increase() {
    let (client, mut server) = setup();

    let requests: Vec<_> = (0..3).map(|_| client.rpc("m", vec![])).collect();
    let ids: Vec<_> = requests.iter().map(RpcRequest::request_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    for expected in 1..=3 {
        assert_eq!(server.recv().await.msgid, expected);
    }
}

#[tokio::test]
async fn test_responses_out_of_order() {
    let (client, mut server) = setup();

    let requests: Vec<_> = (0..3).map(|i| client.rpc("m", vec![json!(i)])).collect();
    let calls = [server.recv().await, server.recv().await, server.recv().await];

    for call in calls.iter().rev() {
        let arg = call.items().unwrap()[0].clone();
        server.send(FastMessage::rpc_data(call.msgid, "m", vec![json!({"echo": arg})])).await;
        server.send(FastMessage::rpc_end(call.msgid, "m")).await;
    }

    for (i, request) in requests.into_iter().enumerate() {
        assert_eq!(finish(request).await.unwrap(), vec![json!({"echo": i})]);
    }
}

#[tokio::test]
async fn test_recent_requests_are_bounded() {
    let (client, mut server) = setup_with(ClientConfig {
        n_recent_requests: 2,
        ..ClientConfig::default()
    });

    for _ in 0..3 {
        let request = client.rpc("m", vec![]);
        let call = server.recv().await;
        server.send(FastMessage::rpc_end(call.msgid, "m")).await;
        finish(request).await.unwrap();
    }

    let ids: Vec<_> = client.recent_requests().iter().map(|r| r.msgid).collect();
    assert_eq!(ids, vec![2, 3]);
}

// ============================================================================
// Server errors
// ============================================================================

#[tokio::test]
async fn test_server_error() {
    let (client, mut server) = setup();

    let mut request = client.rpc("fail", vec![]);
    let call = server.recv().await;

    server.send(FastMessage::rpc_data(call.msgid, "fail", vec![json!(1)])).await;
    let error = RpcError::new("MyError", "boom")
        .with_info(json!({"detail": true}))
        .with_context(json!({"n": 3}));
    server.send(FastMessage::rpc_error(call.msgid, Some("fail"), &error)).await;

    assert_eq!(next_item(&mut request).await.unwrap().unwrap(), json!(1));
    let err = next_item(&mut request).await.unwrap().unwrap_err();
    assert!(next_item(&mut request).await.is_none());

    assert_eq!(err.msgid, call.msgid);
    assert_eq!(err.method, "fail");
    assert_eq!(err.to_string(), "request failed: server error: boom");
    let server_error = err.cause.server_error().unwrap();
    assert_eq!(server_error.name(), "MyError");
    assert_eq!(server_error.info(), Some(&json!({"detail": true})));
    assert_eq!(server_error.context(), Some(&json!({"n": 3})));

    // A server error only affects its own request.
    assert!(client.failure().is_none());
    let recent = client.recent_requests();
    assert!(matches!(&recent[0].outcome, RecentOutcome::Failed(m) if m == "server error: boom"));
}

// ============================================================================
// Whole-client failures
// ============================================================================

#[tokio::test]
async fn test_unexpected_end_of_stream() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    server.recv().await;
    drop(server);

    let err = finish(request).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Protocol(FastProtocolError::UnexpectedEnd)));
    assert_eq!(err.to_string(), "request failed: unexpected end of transport stream");

    let failure = timeout(TIMEOUT, client.failed()).await.unwrap();
    assert!(matches!(failure, RequestFailure::Protocol(FastProtocolError::UnexpectedEnd)));
}

#[tokio::test]
async fn test_partial_message_at_end_of_stream() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    let call = server.recv().await;
    let bytes = encoded(&FastMessage::rpc_end(call.msgid, "m"));
    server.send_raw(&bytes[..bytes.len() - 4]).await;
    drop(server);

    let err = finish(request).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Protocol(FastProtocolError::IncompleteMessage)));
}

#[tokio::test]
async fn test_invalid_message_fails_client() {
    let (client, mut server) = setup();

    let first = client.rpc("m", vec![]);
    let second = client.rpc("m", vec![]);
    server.recv().await;
    server.recv().await;

    let mut bytes = encoded(&FastMessage::rpc_end(1, "m"));
    bytes[0] = 2;
    server.send_raw(&bytes).await;

    for request in [first, second] {
        let err = finish(request).await.unwrap_err();
        assert!(matches!(
            err.cause,
            RequestFailure::Protocol(FastProtocolError::UnsupportedVersion { found: 2 })
        ));
    }
    // The client dropped its end of the transport.
    server.expect_closed().await;
}

#[tokio::test]
async fn test_unknown_msgid_fails_client() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    server.recv().await;
    server.send(FastMessage::rpc_end(47, "m")).await;

    let err = finish(request).await.unwrap_err();
    assert!(matches!(
        err.cause,
        RequestFailure::Protocol(FastProtocolError::UnknownMsgid { msgid: 47 })
    ));
    assert_eq!(
        client.failure().unwrap().to_string(),
        "fast protocol: received message with unknown msgid 47"
    );
}

#[tokio::test]
async fn test_socket_error_fails_client() {
    let (reset_tx, reset_rx) = oneshot::channel();
    let written = Arc::new(AtomicUsize::new(0));
    let transport = ResettableTransport {
        reset: reset_rx,
        written: written.clone(),
    };
    let client = FastClient::new(transport, ClientConfig::default());

    let requests: Vec<_> = (0..3).map(|_| client.rpc("m", vec![])).collect();
    let sent: usize = (1..=3).map(|msgid| encoded(&FastMessage::rpc_call(msgid, "m", vec![])).len()).sum();
    timeout(TIMEOUT, async {
        while written.load(Ordering::SeqCst) < sent {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    reset_tx.send(()).unwrap();

    for request in requests {
        let err = finish(request).await.unwrap_err();
        match &err.cause {
            RequestFailure::Transport(FastTransportError::Io(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected cause: {other:?}"),
        }
        assert!(err.to_string().starts_with("request failed: unexpected error on transport"));
    }

    // Later requests fail without touching the transport.
    let late = client.rpc("m", vec![]);
    let err = finish(late).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Transport(FastTransportError::TransportDetached)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(written.load(Ordering::SeqCst), sent);
}

#[tokio::test]
async fn test_requests_after_failure_fail_immediately() {
    let (client, server) = setup();
    drop(server);
    timeout(TIMEOUT, client.failed()).await.unwrap();

    let request = client.rpc("late", vec![]);
    assert_eq!(request.request_id(), 1);
    let err = finish(request).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Transport(FastTransportError::TransportDetached)));
    assert_eq!(err.to_string(), "request failed: transport detached");

    // The failure cause does not change.
    assert!(matches!(client.failure(), Some(RequestFailure::Protocol(FastProtocolError::UnexpectedEnd))));
}

#[tokio::test]
async fn test_detach() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    server.recv().await;
    client.detach();
    client.detach();

    let err = finish(request).await.unwrap_err();
    assert_eq!(err.to_string(), "request failed: client detached from transport");
    server.expect_closed().await;

    let late = finish(client.rpc("m", vec![])).await.unwrap_err();
    assert_eq!(late.to_string(), "request failed: transport detached");
    assert!(matches!(client.failure(), Some(RequestFailure::Transport(FastTransportError::Detached))));
}

#[tokio::test]
async fn test_dropping_client_detaches() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    server.recv().await;
    drop(client);

    let err = finish(request).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Transport(FastTransportError::Detached)));
    server.expect_closed().await;
}

// ============================================================================
// Aborts
// ============================================================================

#[tokio::test]
async fn test_abort_before_response() {
    let (client, mut server) = setup();

    let request = client.rpc("slow", vec![]);
    let call = server.recv().await;
    request.abort();
    request.abort();

    let err = finish(request).await.unwrap_err();
    assert!(err.cause.is_aborted());
    assert_eq!(err.to_string(), "request failed: request aborted");

    // The server's late answer is dropped quietly.
    server.send(FastMessage::rpc_data(call.msgid, "slow", vec![json!(1)])).await;
    server.send(FastMessage::rpc_end(call.msgid, "slow")).await;

    let next = client.rpc("m", vec![]);
    let call = server.recv().await;
    server.send(FastMessage::rpc_end(call.msgid, "m")).await;
    finish(next).await.unwrap();

    assert!(client.failure().is_none());
    assert_eq!(client.outstanding(), 0);
    assert_eq!(client.recent_requests()[0].outcome, RecentOutcome::Aborted);
}

#[tokio::test]
async fn test_abort_after_some_data() {
    let (client, mut server) = setup();

    let mut request = client.rpc("stream", vec![]);
    let call = server.recv().await;
    server.send(FastMessage::rpc_data(call.msgid, "stream", vec![json!("a")])).await;
    assert_eq!(next_item(&mut request).await.unwrap().unwrap(), json!("a"));

    request.abort();
    server.send(FastMessage::rpc_data(call.msgid, "stream", vec![json!("b")])).await;
    server.send(FastMessage::rpc_error(call.msgid, Some("stream"), &RpcError::new("E", "late"))).await;

    let err = next_item(&mut request).await.unwrap().unwrap_err();
    assert!(err.cause.is_aborted());
    assert!(next_item(&mut request).await.is_none());

    let next = client.rpc("m", vec![]);
    let call = server.recv().await;
    server.send(FastMessage::rpc_end(call.msgid, "m")).await;
    finish(next).await.unwrap();
    assert!(client.failure().is_none());
}

#[tokio::test]
async fn test_abort_after_completion_has_no_effect() {
    let (client, mut server) = setup();

    let mut request = client.rpc("m", vec![]);
    let call = server.recv().await;
    server.send(FastMessage::rpc_data(call.msgid, "m", vec![json!(1)])).await;
    server.send(FastMessage::rpc_end(call.msgid, "m")).await;

    timeout(TIMEOUT, async {
        while client.outstanding() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    request.abort();
    assert_eq!(next_item(&mut request).await.unwrap().unwrap(), json!(1));
    assert!(next_item(&mut request).await.is_none());
}

#[tokio::test]
async fn test_abort_after_client_failure() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    server.recv().await;
    client.detach();
    request.abort();

    let err = finish(request).await.unwrap_err();
    assert!(matches!(err.cause, RequestFailure::Transport(FastTransportError::Detached)));
}

#[tokio::test]
async fn test_dropped_request_is_aborted() {
    let (client, mut server) = setup();

    let request = client.rpc("m", vec![]);
    let call = server.recv().await;
    drop(request);

    server.send(FastMessage::rpc_end(call.msgid, "m")).await;
    let next = client.rpc("m", vec![]);
    let second = server.recv().await;
    assert_ne!(second.msgid, call.msgid);
    server.send(FastMessage::rpc_end(second.msgid, "m")).await;
    finish(next).await.unwrap();

    assert!(client.failure().is_none());
    assert_eq!(client.recent_requests()[0].outcome, RecentOutcome::Aborted);
}
