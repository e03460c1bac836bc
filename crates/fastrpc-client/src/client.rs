use fastrpc_common::{
    CodecError, EncodeError, FastMessage, FastMessageDecoder, FastMessageEncoder,
    FastProtocolError, FastStatus, FastTransportError, IdAllocator, RpcError, FP_MSGID_MAX,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{
    FastRequestAbortedError, FastRequestError, FastServerError, RequestFailure,
};
use crate::request::{RequestEvent, RpcRequest};

/// Msgids are allocated from `[1, 2^31 - 1]`.
const MSGIDS: IdAllocator = IdAllocator::new_const(1, FP_MSGID_MAX);

/// Client configuration.
///
/// # Default Configuration
///
/// - `n_recent_requests`: 30
/// - `max_message_size`: unlimited
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many finished requests to remember for
    /// [`FastClient::recent_requests`].
    pub n_recent_requests: usize,
    /// Largest response payload accepted; larger ones fail the client.
    pub max_message_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            n_recent_requests: 30,
            max_message_size: None,
        }
    }
}

/// How a remembered request finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecentOutcome {
    Ended,
    Aborted,
    Failed(String),
}

/// A finished request, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentRequest {
    pub msgid: u32,
    pub method: String,
    /// Number of DATA messages received.
    pub ndata: u64,
    pub outcome: RecentOutcome,
}

struct Outstanding {
    seq: u64,
    method: String,
    /// `None` once the caller aborted.
    events: Option<mpsc::UnboundedSender<RequestEvent>>,
    ndata: u64,
}

impl Outstanding {
    fn emit(&self, event: RequestEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

struct ClientState {
    outstanding: HashMap<u32, Outstanding>,
    msgids: IdAllocator,
    failure: Option<RequestFailure>,
    recent: VecDeque<RecentRequest>,
    n_recent: usize,
    next_seq: u64,
    tasks: Vec<AbortHandle>,
}

impl ClientState {
    fn remember(&mut self, msgid: u32, entry: &Outstanding, failure: Option<&RequestFailure>) {
        if self.n_recent == 0 {
            return;
        }
        let outcome = match (&entry.events, failure) {
            (None, _) => RecentOutcome::Aborted,
            (Some(_), None) => RecentOutcome::Ended,
            (Some(_), Some(failure)) => RecentOutcome::Failed(failure.to_string()),
        };
        if self.recent.len() == self.n_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentRequest {
            msgid,
            method: entry.method.clone(),
            ndata: entry.ndata,
            outcome,
        });
    }
}

/// State shared between the client handle, its request handles and its
/// transport tasks.
pub(crate) struct ClientShared {
    state: Mutex<ClientState>,
    outbound: mpsc::UnboundedSender<FastMessage>,
    failure: watch::Sender<Option<RequestFailure>>,
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_message(&self, mut msg: FastMessage) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.failure.is_some() {
            return false;
        }

        let msgid = msg.msgid;
        let Some(entry) = state.outstanding.get_mut(&msgid) else {
            self.fail_locked(state, FastProtocolError::UnknownMsgid { msgid }.into());
            return false;
        };

        match msg.status {
            FastStatus::Data => {
                entry.ndata += 1;
                for item in msg.take_items() {
                    entry.emit(RequestEvent::Data(item));
                }
            }
            FastStatus::End => {
                if let Some(entry) = state.outstanding.remove(&msgid) {
                    for item in msg.take_items() {
                        entry.emit(RequestEvent::Data(item));
                    }
                    entry.emit(RequestEvent::End);
                    tracing::debug!(msgid, method = %entry.method, "request completed");
                    state.remember(msgid, &entry, None);
                }
            }
            FastStatus::Error => {
                if let Some(entry) = state.outstanding.remove(&msgid) {
                    let error = msg
                        .error()
                        .unwrap_or_else(|| RpcError::new("Error", "malformed error from server"));
                    let cause = RequestFailure::Server(FastServerError(error));
                    tracing::debug!(msgid, method = %entry.method, "request failed: {}", cause);
                    state.remember(msgid, &entry, Some(&cause));
                    entry.emit(RequestEvent::Error(FastRequestError::new(msgid, &entry.method, cause)));
                }
            }
        }
        true
    }

    pub(crate) fn fail(&self, cause: RequestFailure) {
        let mut guard = self.lock();
        self.fail_locked(&mut guard, cause);
    }

    fn fail_locked(&self, state: &mut ClientState, cause: RequestFailure) {
        if let Some(existing) = &state.failure {
            tracing::debug!("ignoring error after client failure ({}): {}", existing, cause);
            return;
        }

        tracing::warn!(outstanding = state.outstanding.len(), "client failed: {}", cause);
        state.failure = Some(cause.clone());

        let mut failed: Vec<(u32, Outstanding)> = state.outstanding.drain().collect();
        failed.sort_by_key(|(msgid, _)| *msgid);
        for (msgid, entry) in failed {
            state.remember(msgid, &entry, Some(&cause));
            entry.emit(RequestEvent::Error(FastRequestError::new(msgid, &entry.method, cause.clone())));
        }

        for task in state.tasks.drain(..) {
            task.abort();
        }
        self.failure.send_replace(Some(cause));
    }

    pub(crate) fn abort(&self, msgid: u32, seq: u64) {
        let mut state = self.lock();
        let Some(entry) = state.outstanding.get_mut(&msgid) else {
            return;
        };
        if entry.seq != seq {
            return;
        }
        let Some(events) = entry.events.take() else {
            return;
        };

        tracing::debug!(msgid, method = %entry.method, "aborting request");
        let error = FastRequestError::new(msgid, &entry.method, FastRequestAbortedError.into());
        let _ = events.send(RequestEvent::Error(error));
    }
}

/// A client attached to one byte stream.
///
/// Dropping the client detaches it from the stream, failing whatever is
/// still outstanding.
pub struct FastClient {
    shared: Arc<ClientShared>,
}

impl FastClient {
    /// Attaches a client to `transport`. Must be called from within a tokio
    /// runtime.
    pub fn new<T>(transport: T, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (failure_tx, _) = watch::channel(None);

        let shared = Arc::new(ClientShared {
            state: Mutex::new(ClientState {
                outstanding: HashMap::new(),
                msgids: MSGIDS,
                failure: None,
                recent: VecDeque::with_capacity(config.n_recent_requests),
                n_recent: config.n_recent_requests,
                next_seq: 0,
                tasks: Vec::new(),
            }),
            outbound: outbound_tx,
            failure: failure_tx,
        });

        let mut decoder = FastMessageDecoder::new();
        if let Some(max) = config.max_message_size {
            decoder = decoder.with_max_message_size(max);
        }

        let read_task = tokio::spawn(read_loop(shared.clone(), reader, decoder));
        let write_task = tokio::spawn(write_loop(shared.clone(), writer, outbound_rx));
        {
            let mut state = shared.lock();
            if state.failure.is_some() {
                // The transport failed before the tasks could be recorded.
                read_task.abort();
                write_task.abort();
            } else {
                state.tasks = vec![read_task.abort_handle(), write_task.abort_handle()];
            }
        }

        Self { shared }
    }

    /// Connects to a server over TCP.
    pub async fn connect_tcp(addr: impl ToSocketAddrs, config: ClientConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, config))
    }

    /// Connects to a server over a Unix domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>, config: ClientConfig) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream, config))
    }

    /// Calls `method` with `args`.
    ///
    /// The request is sent right away; its results are read from the
    /// returned handle. If the client has already failed, the handle yields
    /// a "transport detached" error.
    pub fn rpc(&self, method: &str, args: Vec<Value>) -> RpcRequest {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let seq = state.next_seq;
        state.next_seq += 1;

        let msgid = match state.msgids.alloc(|id| state.outstanding.contains_key(&id)) {
            Ok(msgid) => msgid,
            Err(e) => {
                tracing::warn!(method, "cannot issue request: {}", e);
                let error = FastRequestError::new(0, method, RequestFailure::IdsExhausted(e));
                let _ = events_tx.send(RequestEvent::Error(error));
                return RpcRequest::new(0, seq, method.to_string(), events_rx, self.shared.clone());
            }
        };

        let request = RpcRequest::new(msgid, seq, method.to_string(), events_rx, self.shared.clone());
        if state.failure.is_some() {
            let error = FastRequestError::new(msgid, method, FastTransportError::TransportDetached.into());
            let _ = events_tx.send(RequestEvent::Error(error));
            return request;
        }

        state.outstanding.insert(
            msgid,
            Outstanding {
                seq,
                method: method.to_string(),
                events: Some(events_tx),
                ndata: 0,
            },
        );
        tracing::debug!(msgid, method, "sending request");
        let _ = self.shared.outbound.send(FastMessage::rpc_call(msgid, method, args));
        request
    }

    /// Detaches from the transport. Every outstanding request fails with
    /// "client detached from transport". Does nothing if the client has
    /// already failed.
    pub fn detach(&self) {
        self.shared.fail(FastTransportError::Detached.into());
    }

    /// The error that failed the client, if any.
    pub fn failure(&self) -> Option<RequestFailure> {
        self.shared.lock().failure.clone()
    }

    /// Waits until the client fails and returns the cause.
    pub async fn failed(&self) -> RequestFailure {
        let mut failure = self.shared.failure.subscribe();
        loop {
            if let Some(cause) = failure.borrow_and_update().clone() {
                return cause;
            }
            if failure.changed().await.is_err() {
                return FastTransportError::Detached.into();
            }
        }
    }

    /// Number of requests waiting for a terminal message.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    /// The most recently finished requests, oldest first.
    pub fn recent_requests(&self) -> Vec<RecentRequest> {
        self.shared.lock().recent.iter().cloned().collect()
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn read_loop<T>(shared: Arc<ClientShared>, reader: ReadHalf<T>, decoder: FastMessageDecoder)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut frames = FramedRead::new(reader, decoder);
    loop {
        let cause: RequestFailure = match frames.next().await {
            Some(Ok(msg)) => {
                if shared.on_message(msg) {
                    continue;
                }
                return;
            }
            Some(Err(CodecError::Protocol(e))) => e.into(),
            Some(Err(CodecError::Io(e))) => FastTransportError::from(e).into(),
            None => FastProtocolError::UnexpectedEnd.into(),
        };
        shared.fail(cause);
        return;
    }
}

async fn write_loop<T>(
    shared: Arc<ClientShared>,
    writer: WriteHalf<T>,
    mut outbound: mpsc::UnboundedReceiver<FastMessage>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, FastMessageEncoder);

    while let Some(msg) = outbound.recv().await {
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
            shared.fail(FastTransportError::from(error).into());
            return;
        }
    }
}
