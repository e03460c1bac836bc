//! The handler's view of one request.

use fastrpc_common::{FastMessage, RpcError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::server::{RequestOutcome, ServerEvent};

/// Handle given to an RPC handler for a single request.
///
/// Result items are streamed with [`write`](RpcContext::write), which waits
/// whenever the connection's outbound queue is full. The request is finished
/// by consuming the context with [`end`](RpcContext::end) or
/// [`fail`](RpcContext::fail); once either is called nothing more can be
/// written.
///
/// If the client connection goes away while the handler is running, writes
/// become no-ops and [`is_disconnected`](RpcContext::is_disconnected)
/// returns `true`. The handler should still finish the request.
///
/// Dropping the context without finishing it fails the request with a
/// `FastError` whose reason is `handler_abandoned`.
pub struct RpcContext {
    conn_id: u32,
    msgid: u32,
    method: String,
    args: Vec<Value>,
    outbound: mpsc::Sender<FastMessage>,
    disconnected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ServerEvent>,
    finished: bool,
}

impl RpcContext {
    pub(crate) fn new(
        conn_id: u32,
        msgid: u32,
        method: String,
        args: Vec<Value>,
        outbound: mpsc::Sender<FastMessage>,
        disconnected: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            conn_id,
            msgid,
            method,
            args,
            outbound,
            disconnected,
            events,
            finished: false,
        }
    }

    /// Server-assigned id of the connection this request arrived on.
    pub fn connection_id(&self) -> u32 {
        self.conn_id
    }

    /// The client's msgid for this request.
    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    /// Returns a copy of the call's arguments.
    pub fn argv(&self) -> Vec<Value> {
        self.args.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Sends one result item to the client.
    pub async fn write(&mut self, item: Value) {
        if self.is_disconnected() {
            return;
        }
        let msg = FastMessage::rpc_data(self.msgid, &self.method, vec![item]);
        if self.outbound.send(msg).await.is_err() {
            tracing::trace!(conn_id = self.conn_id, msgid = self.msgid, "discarding output for closed connection");
        }
    }

    /// Completes the request successfully.
    pub async fn end(mut self) {
        let msg = FastMessage::rpc_end(self.msgid, &self.method);
        self.finish(RequestOutcome::Ended, msg).await;
    }

    /// Completes the request with an error. The client sees `name`,
    /// `message`, `info` and `context` of `error`.
    pub async fn fail(mut self, error: RpcError) {
        let msg = FastMessage::rpc_error(self.msgid, Some(&self.method), &error);
        self.finish(RequestOutcome::Failed(error), msg).await;
    }

    async fn finish(&mut self, outcome: RequestOutcome, terminal: FastMessage) {
        self.finished = true;
        // Bookkeeping goes first: by the time the client can see the
        // terminal message, the msgid must be free for reuse.
        self.notify(outcome);
        if !self.is_disconnected() {
            let _ = self.outbound.send(terminal).await;
        }
    }

    fn notify(&self, outcome: RequestOutcome) {
        let _ = self.events.send(ServerEvent::RequestDone {
            conn_id: self.conn_id,
            msgid: self.msgid,
            outcome,
        });
    }
}

impl Drop for RpcContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        tracing::warn!(
            conn_id = self.conn_id,
            msgid = self.msgid,
            method = %self.method,
            "handler dropped request without completing it"
        );
        let error = RpcError::new("FastError", "RPC handler did not complete the request").with_info(
            json!({
                "fastReason": "handler_abandoned",
                "rpcMethod": self.method,
                "rpcMsgid": self.msgid,
            }),
        );
        let terminal = FastMessage::rpc_error(self.msgid, Some(&self.method), &error);
        self.notify(RequestOutcome::Failed(error));

        if self.is_disconnected() {
            return;
        }
        if let Err(TrySendError::Full(msg)) = self.outbound.try_send(terminal) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let outbound = self.outbound.clone();
                runtime.spawn(async move {
                    let _ = outbound.send(msg).await;
                });
            }
        }
    }
}
