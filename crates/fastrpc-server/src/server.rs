//! Method registry and the connection dispatcher.
//!
//! All connection and request state lives in a single [`Dispatcher`] task.
//! Reader, writer and handler tasks never touch that state directly; they
//! report to the dispatcher through one unbounded event channel, which
//! serializes every state transition.

use fastrpc_common::{
    CodecError, FastMessage, FastProtocolError, FastStatus, IdAllocator, RpcError,
};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::connection::{BoxedReader, BoxedWriter, Connection};
use crate::context::RpcContext;
use crate::listener::Listener;
use crate::stats::{MethodStats, ServerStats};

/// Connection ids are allocated from `[1, 2^30 - 1]`.
const CONN_IDS: IdAllocator = IdAllocator::new_const(1, (1 << 30) - 1);

/// Pause after a failed accept, so a persistent error (such as running out
/// of file descriptors) does not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("RPC method already registered: \"{0}\"")]
    DuplicateMethod(String),

    #[error("server is shut down")]
    ShutDown,
}

/// Server configuration.
///
/// # Default Configuration
///
/// - `outbound_queue_depth`: 64 messages
/// - `max_message_size`: unlimited
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of each connection's response queue. A handler writing to a
    /// full queue waits until the client catches up.
    pub outbound_queue_depth: usize,
    /// Largest request payload accepted; larger ones are a protocol error.
    pub max_message_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_queue_depth: 64,
            max_message_size: None,
        }
    }
}

type HandlerFn = Box<dyn Fn(RpcContext) -> BoxFuture<'static, ()> + Send + Sync>;

struct RpcHandler {
    func: HandlerFn,
    started: u64,
    completed: u64,
    errors: u64,
}

/// How a handler finished its request.
#[derive(Debug)]
pub(crate) enum RequestOutcome {
    Ended,
    Failed(RpcError),
}

pub(crate) enum ServerEvent {
    Accepted {
        reader: BoxedReader,
        writer: BoxedWriter,
        label: String,
    },
    Message {
        conn_id: u32,
        message: FastMessage,
    },
    InputEnded {
        conn_id: u32,
    },
    InputFailed {
        conn_id: u32,
        error: CodecError,
    },
    OutputFailed {
        conn_id: u32,
        error: io::Error,
    },
    RequestDone {
        conn_id: u32,
        msgid: u32,
        outcome: RequestOutcome,
    },
    Close,
    Stats(oneshot::Sender<ServerStats>),
}

/// A set of RPC methods waiting to be served.
pub struct FastServer {
    config: ServerConfig,
    handlers: HashMap<String, RpcHandler>,
}

impl FastServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for requests naming `name`.
    ///
    /// The handler is invoked once per request, in the order requests arrive
    /// on the server, and runs as its own task.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::DuplicateMethod`] if `name` is already taken.
    pub fn register_rpc_method<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<(), ServerError>
    where
        F: Fn(RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(ServerError::DuplicateMethod(name));
        }

        tracing::debug!(method = %name, "registered RPC method");
        let func: HandlerFn = Box::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(
            name,
            RpcHandler {
                func,
                started: 0,
                completed: 0,
                errors: 0,
            },
        );
        Ok(())
    }

    /// Starts accepting connections from `listener`.
    ///
    /// Must be called from within a tokio runtime. The returned handle is
    /// used to inspect and shut down the server.
    pub fn serve<L: Listener>(self, listener: L) -> ServerHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let acceptor = tokio::spawn(accept_loop(listener, events_tx.clone()));
        let dispatcher = Dispatcher {
            config: self.config,
            handlers: self.handlers,
            conns: HashMap::new(),
            conn_ids: CONN_IDS,
            events: events_tx.clone(),
            acceptor: Some(acceptor),
            closed: false,
            nignored_noconn: 0,
            nignored_badconn: 0,
            nignored_aborts: 0,
        };
        tokio::spawn(dispatcher.run(events_rx, done_tx));

        ServerHandle {
            events: events_tx,
            done: done_rx,
        }
    }
}

/// Control handle for a running server. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<ServerEvent>,
    done: watch::Receiver<bool>,
}

impl ServerHandle {
    /// Stops accepting connections and terminates the existing ones.
    ///
    /// Handlers still running are not interrupted, but their output is
    /// discarded. Use [`closed`](ServerHandle::closed) to wait for them.
    pub fn close(&self) {
        let _ = self.events.send(ServerEvent::Close);
    }

    /// Resolves once the server has shut down and every connection drained.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    pub async fn stats(&self) -> Result<ServerStats, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ServerEvent::Stats(tx))
            .map_err(|_| ServerError::ShutDown)?;
        rx.await.map_err(|_| ServerError::ShutDown)
    }
}

async fn accept_loop<L: Listener>(mut listener: L, events: mpsc::UnboundedSender<ServerEvent>) {
    loop {
        match listener.accept_conn().await {
            Ok((stream, label)) => {
                let (reader, writer) = tokio::io::split(stream);
                let event = ServerEvent::Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    label,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

struct Dispatcher {
    config: ServerConfig,
    handlers: HashMap<String, RpcHandler>,
    conns: HashMap<u32, Connection>,
    conn_ids: IdAllocator,
    events: mpsc::UnboundedSender<ServerEvent>,
    acceptor: Option<JoinHandle<()>>,
    closed: bool,
    nignored_noconn: u64,
    nignored_badconn: u64,
    nignored_aborts: u64,
}

impl Dispatcher {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ServerEvent>, done: watch::Sender<bool>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event);
            if self.closed && self.conns.is_empty() {
                break;
            }
        }
        tracing::info!("server shut down");
        let _ = done.send(true);
    }

    fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { reader, writer, label } => self.conn_create(reader, writer, label),
            ServerEvent::Message { conn_id, message } => self.on_message(conn_id, message),
            ServerEvent::InputEnded { conn_id } => self.on_input_ended(conn_id),
            ServerEvent::InputFailed { conn_id, error } => match error {
                CodecError::Protocol(e) => self.conn_terminate(conn_id, e),
                CodecError::Io(e) => self.on_connection_error(conn_id, e),
            },
            ServerEvent::OutputFailed { conn_id, error } => self.on_connection_error(conn_id, error),
            ServerEvent::RequestDone { conn_id, msgid, outcome } => self.request_done(conn_id, msgid, outcome),
            ServerEvent::Close => self.close(),
            ServerEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn conn_create(&mut self, reader: BoxedReader, writer: BoxedWriter, label: String) {
        if self.closed {
            tracing::debug!(label = %label, "dropping connection accepted during shutdown");
            return;
        }

        let conn_id = match self.conn_ids.alloc(|id| self.conns.contains_key(&id)) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(label = %label, "dropping connection: {}", e);
                return;
            }
        };

        tracing::debug!(conn_id, label = %label, "connection received");
        let conn = Connection::start(conn_id, label, reader, writer, self.events.clone(), &self.config);
        self.conns.insert(conn_id, conn);
    }

    fn on_message(&mut self, conn_id: u32, mut message: FastMessage) {
        let msgid = message.msgid;
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            tracing::warn!(conn_id, msgid, "dropping message for unknown connection");
            self.nignored_noconn += 1;
            return;
        };
        if conn.is_abandoned() {
            tracing::warn!(conn_id, msgid, label = %conn.label, "dropping message for abandoned connection");
            self.nignored_badconn += 1;
            return;
        }

        match message.status {
            FastStatus::Data => {}
            FastStatus::End => {
                let status = message.status;
                self.conn_terminate(conn_id, FastProtocolError::UnexpectedStatus { status });
                return;
            }
            FastStatus::Error => {
                // Older clients send ERROR to abort a request. Aborts are
                // not supported; the request runs to completion.
                tracing::warn!(conn_id, msgid, label = %conn.label, "ignoring client abort request");
                self.nignored_aborts += 1;
                return;
            }
        }

        if conn.pending.contains_key(&msgid) {
            self.conn_terminate(conn_id, FastProtocolError::DuplicateMsgid { msgid });
            return;
        }

        conn.begin_request(msgid);

        let method_name = message.method_name().filter(|m| !m.is_empty());
        let method = match (method_name, message.items()) {
            (Some(method), Some(_)) => method.to_owned(),
            _ => {
                let error = RpcError::bad_data(&message);
                self.request_fail(conn_id, msgid, error);
                return;
            }
        };

        let Some(handler) = self.handlers.get_mut(&method) else {
            let error = RpcError::bad_method(msgid, &method);
            self.request_fail(conn_id, msgid, error);
            return;
        };

        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let (Some(outbound), Some(request)) = (conn.outbound(), conn.pending.get_mut(&msgid)) else {
            return;
        };

        handler.started += 1;
        request.start(method.clone());

        let span = tracing::info_span!("rpc", conn_id, msgid, method = %method);
        let ctx = RpcContext::new(
            conn_id,
            msgid,
            method,
            message.take_items(),
            outbound,
            request.disconnected.clone(),
            self.events.clone(),
        );
        tracing::debug!(parent: &span, "request started");
        tokio::spawn((handler.func)(ctx).instrument(span));
    }

    fn request_fail(&mut self, conn_id: u32, msgid: u32, error: RpcError) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let Some(request) = conn.pending.get_mut(&msgid) else {
            return;
        };

        tracing::error!(conn_id, msgid, method = request.method.as_deref().unwrap_or(""), "request failed: {}", error);
        let reply = FastMessage::rpc_error(msgid, request.method.as_deref(), &error);
        request.complete(Some(error));
        conn.send_detached(reply);
        self.request_cleanup(conn_id, msgid);
    }

    fn request_done(&mut self, conn_id: u32, msgid: u32, outcome: RequestOutcome) {
        let Some(request) = self
            .conns
            .get_mut(&conn_id)
            .and_then(|conn| conn.pending.get_mut(&msgid))
        else {
            tracing::warn!(conn_id, msgid, "completion for unknown request");
            return;
        };

        let method = request.method.as_deref().unwrap_or("");
        match outcome {
            RequestOutcome::Ended if request.is_disconnected() => {
                tracing::info!(conn_id, msgid, method, "disconnected request finished");
                request.complete(None);
            }
            RequestOutcome::Ended => {
                tracing::info!(conn_id, msgid, method, "request completed normally");
                request.complete(None);
            }
            RequestOutcome::Failed(error) => {
                tracing::error!(conn_id, msgid, method, "request failed: {}", error);
                request.complete(Some(error));
            }
        }
        self.request_cleanup(conn_id, msgid);
    }

    fn request_cleanup(&mut self, conn_id: u32, msgid: u32) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let Some(request) = conn.pending.remove(&msgid) else {
            return;
        };

        let failed = request.error.is_some();
        conn.ncompleted += 1;
        if failed {
            conn.nerrors += 1;
        }

        if let Some(handler) = request.method.as_ref().and_then(|m| self.handlers.get_mut(m)) {
            handler.completed += 1;
            if failed {
                handler.errors += 1;
            }
        }

        if conn.draining {
            self.conn_drain(conn_id);
        }
    }

    /// Removes the connection once it has no pending requests.
    fn conn_drain(&mut self, conn_id: u32) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };

        if !conn.pending.is_empty() {
            if !conn.draining {
                tracing::debug!(conn_id, pending = conn.pending.len(), "waiting for pending requests to complete");
                conn.draining = true;
            }
            return;
        }

        let Some(mut conn) = self.conns.remove(&conn_id) else {
            return;
        };
        tracing::info!(conn_id, label = %conn.label, "removing drained connection");
        if conn.socket_error.is_none() && conn.server_error.is_none() {
            conn.close_gracefully();
        }
    }

    fn conn_terminate(&mut self, conn_id: u32, reason: impl fmt::Display) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if let Some(existing) = &conn.server_error {
            tracing::warn!(conn_id, "connection already terminating ({}), ignoring: {}", existing, reason);
            return;
        }

        let reason = reason.to_string();
        tracing::warn!(conn_id, label = %conn.label, "terminating connection: {}", reason);
        conn.server_error = Some(reason);
        conn.disconnect_requests();
        self.conn_drain(conn_id);
    }

    fn on_connection_error(&mut self, conn_id: u32, error: io::Error) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            tracing::debug!(conn_id, "socket error on removed connection: {}", error);
            return;
        };
        if conn.socket_error.is_some() {
            tracing::debug!(conn_id, "ignoring additional socket error: {}", error);
            return;
        }

        tracing::warn!(conn_id, label = %conn.label, "socket error: {}", error);
        conn.socket_error = Some(error.to_string());
        conn.disconnect_requests();
        self.conn_drain(conn_id);
    }

    fn on_input_ended(&mut self, conn_id: u32) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        tracing::debug!(conn_id, label = %conn.label, "end of input");
        conn.ended = true;
        self.conn_drain(conn_id);
    }

    fn close(&mut self) {
        if self.closed {
            tracing::warn!("server already shutting down");
            return;
        }

        tracing::info!("shutting down");
        self.closed = true;
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }

        let conn_ids: Vec<u32> = self.conns.keys().copied().collect();
        for conn_id in conn_ids {
            self.conn_terminate(conn_id, "server is shutting down");
        }
    }

    fn stats(&self) -> ServerStats {
        let mut connections: Vec<_> = self.conns.values().map(Connection::stats).collect();
        connections.sort_by_key(|c| c.conn_id);

        let mut methods: Vec<_> = self
            .handlers
            .iter()
            .map(|(name, handler)| MethodStats {
                name: name.clone(),
                started: handler.started,
                completed: handler.completed,
                errors: handler.errors,
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));

        ServerStats {
            closed: self.closed,
            connections,
            methods,
            ignored_noconn: self.nignored_noconn,
            ignored_badconn: self.nignored_badconn,
            ignored_aborts: self.nignored_aborts,
        }
    }
}
