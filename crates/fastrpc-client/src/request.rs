use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;

use crate::client::ClientShared;
use crate::error::FastRequestError;

/// What the client delivers to a request handle.
#[derive(Debug)]
pub(crate) enum RequestEvent {
    Data(Value),
    End,
    Error(FastRequestError),
}

/// Handle for one outstanding RPC call.
///
/// Yields each result item in order, then ends. If the request fails, the
/// last thing yielded is the error. Dropping the handle before the request
/// finishes aborts it.
pub struct RpcRequest {
    msgid: u32,
    seq: u64,
    method: String,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    client: Arc<ClientShared>,
    done: bool,
}

impl RpcRequest {
    pub(crate) fn new(
        msgid: u32,
        seq: u64,
        method: String,
        events: mpsc::UnboundedReceiver<RequestEvent>,
        client: Arc<ClientShared>,
    ) -> Self {
        Self {
            msgid,
            seq,
            method,
            events,
            client,
            done: false,
        }
    }

    /// The msgid this request was sent with.
    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    /// Stops delivery for this request.
    ///
    /// Items already received are still yielded, followed by a
    /// [`FastRequestAbortedError`](crate::FastRequestAbortedError). The server is
    /// not told; whatever it still sends for this msgid is discarded. Has no
    /// effect if the request already finished.
    pub fn abort(&self) {
        self.client.abort(self.msgid, self.seq);
    }

    /// Waits for the request to finish and returns every item it produced.
    pub async fn collect_items(mut self) -> Result<Vec<Value>, FastRequestError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Stream for RpcRequest {
    type Item = Result<Value, FastRequestError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match ready!(self.events.poll_recv(cx)) {
            Some(RequestEvent::Data(item)) => Poll::Ready(Some(Ok(item))),
            Some(RequestEvent::Error(e)) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Some(RequestEvent::End) | None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for RpcRequest {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}
