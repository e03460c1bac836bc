use fastrpc_common::{EncodeError, FastMessage, FastMessageDecoder, FastMessageEncoder};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::request::ServerRequest;
use crate::server::{ServerConfig, ServerEvent};
use crate::stats::{ConnectionState, ConnectionStats};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Dispatcher-side state for one client connection.
///
/// The socket itself is owned by two tasks: a reader feeding decoded
/// messages to the dispatcher, and a writer draining `outbound`. Handlers
/// hold clones of the `outbound` sender, so the writer only finishes (and
/// shuts the socket down) once the dispatcher and every handler have let go.
pub(crate) struct Connection {
    pub(crate) conn_id: u32,
    pub(crate) label: String,
    pub(crate) pending: HashMap<u32, ServerRequest>,
    pub(crate) nstarted: u64,
    pub(crate) ncompleted: u64,
    pub(crate) nerrors: u64,
    /// The client finished sending.
    pub(crate) ended: bool,
    pub(crate) socket_error: Option<String>,
    /// Set when the server decided to terminate the connection.
    pub(crate) server_error: Option<String>,
    pub(crate) draining: bool,
    outbound: Option<mpsc::Sender<FastMessage>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn start(
        conn_id: u32,
        label: String,
        reader: BoxedReader,
        writer: BoxedWriter,
        events: mpsc::UnboundedSender<ServerEvent>,
        config: &ServerConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth.max(1));

        let mut decoder = FastMessageDecoder::new();
        if let Some(max) = config.max_message_size {
            decoder = decoder.with_max_message_size(max);
        }

        let reader = tokio::spawn(read_loop(conn_id, reader, decoder, events.clone()));
        let writer = tokio::spawn(write_loop(conn_id, outbound_rx, writer, events));

        Self {
            conn_id,
            label,
            pending: HashMap::new(),
            nstarted: 0,
            ncompleted: 0,
            nerrors: 0,
            ended: false,
            socket_error: None,
            server_error: None,
            draining: false,
            outbound: Some(outbound_tx),
            reader,
            writer,
        }
    }

    /// Messages arriving on an abandoned connection are dropped.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.ended || self.socket_error.is_some() || self.server_error.is_some()
    }

    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<FastMessage>> {
        self.outbound.clone()
    }

    pub(crate) fn begin_request(&mut self, msgid: u32) {
        self.nstarted += 1;
        self.pending.insert(msgid, ServerRequest::new(msgid));
    }

    /// Queues a message without waiting. The dispatcher must never block on
    /// a slow client, so a full queue hands the message to a short-lived
    /// task instead.
    pub(crate) fn send_detached(&self, msg: FastMessage) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        match outbound.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(msg)) => {
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(msg).await;
                });
            }
        }
    }

    /// Disconnects every pending request and destroys the socket.
    pub(crate) fn disconnect_requests(&mut self) {
        for request in self.pending.values_mut() {
            if request.disconnect() {
                tracing::info!(
                    conn_id = self.conn_id,
                    msgid = request.msgid,
                    method = request.method.as_deref().unwrap_or(""),
                    "disconnecting request"
                );
            }
        }
        self.destroy();
    }

    fn destroy(&mut self) {
        self.outbound = None;
        self.reader.abort();
        self.writer.abort();
    }

    /// Lets queued output flush, then shuts the socket down.
    pub(crate) fn close_gracefully(&mut self) {
        self.outbound = None;
        self.reader.abort();
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            conn_id: self.conn_id,
            label: self.label.clone(),
            state: if self.draining {
                ConnectionState::Draining
            } else {
                ConnectionState::Running
            },
            pending: self.pending.len(),
            started: self.nstarted,
            completed: self.ncompleted,
            errors: self.nerrors,
        }
    }
}

async fn read_loop(
    conn_id: u32,
    reader: BoxedReader,
    decoder: FastMessageDecoder,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut frames = FramedRead::new(reader, decoder);
    loop {
        let event = match frames.next().await {
            Some(Ok(message)) => ServerEvent::Message { conn_id, message },
            Some(Err(error)) => {
                let _ = events.send(ServerEvent::InputFailed { conn_id, error });
                return;
            }
            None => {
                let _ = events.send(ServerEvent::InputEnded { conn_id });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn write_loop(
    conn_id: u32,
    mut outbound: mpsc::Receiver<FastMessage>,
    writer: BoxedWriter,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut sink = FramedWrite::new(writer, FastMessageEncoder);

    while let Some(msg) = outbound.recv().await {
        // Batch whatever is already queued into a single flush.
        let mut result = sink.feed(msg).await;
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(msg) => result = sink.feed(msg).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = sink.flush().await;
        }

        if let Err(e) = result {
            let error = match e {
                EncodeError::Io(e) => e,
                other => io::Error::new(io::ErrorKind::InvalidData, other),
            };
            let _ = events.send(ServerEvent::OutputFailed { conn_id, error });
            return;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(conn_id, "error shutting down connection: {}", e);
    }
}
