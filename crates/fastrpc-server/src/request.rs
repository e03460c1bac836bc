use fastrpc_common::{FastTransportError, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Received, not yet validated.
    Init,
    /// Handed to a handler.
    Running,
    Complete,
}

/// Server-side bookkeeping for one in-flight request.
#[derive(Debug)]
pub(crate) struct ServerRequest {
    pub(crate) msgid: u32,
    pub(crate) method: Option<String>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<RpcError>,
    /// Shared with the handler's context; once set, its output is discarded.
    pub(crate) disconnected: Arc<AtomicBool>,
}

impl ServerRequest {
    pub(crate) fn new(msgid: u32) -> Self {
        Self {
            msgid,
            method: None,
            state: RequestState::Init,
            error: None,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn start(&mut self, method: String) {
        debug_assert_eq!(self.state, RequestState::Init);
        self.method = Some(method);
        self.state = RequestState::Running;
    }

    /// Cuts the request off from its connection. Returns `false` if it was
    /// already disconnected.
    pub(crate) fn disconnect(&mut self) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.error.is_none() {
            self.error = Some(RpcError::new(
                "FastTransportError",
                FastTransportError::Disconnected.to_string(),
            ));
        }
        true
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Moves to COMPLETE. An error recorded earlier (by a disconnect) wins
    /// over a later one.
    pub(crate) fn complete(&mut self, error: Option<RpcError>) {
        if self.error.is_none() {
            self.error = error;
        }
        self.state = RequestState::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut request = ServerRequest::new(4);
        assert_eq!(request.state, RequestState::Init);

        request.start("echo".to_string());
        assert_eq!(request.state, RequestState::Running);
        assert_eq!(request.method.as_deref(), Some("echo"));

        request.complete(None);
        assert_eq!(request.state, RequestState::Complete);
        assert!(request.error.is_none());
    }

    #[test]
    fn test_disconnect_is_sticky() {
        let mut request = ServerRequest::new(1);
        request.start("sleep".to_string());

        assert!(request.disconnect());
        assert!(!request.disconnect());
        assert!(request.is_disconnected());

        request.complete(Some(RpcError::new("Later", "ignored")));
        assert_eq!(request.error.as_ref().unwrap().name, "FastTransportError");
    }
}
