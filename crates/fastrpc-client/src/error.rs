use fastrpc_common::{AllocError, FastProtocolError, FastTransportError, RpcError};
use serde_json::Value;
use thiserror::Error;

/// The server failed the request.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("server error: {}", .0.message)]
pub struct FastServerError(pub RpcError);

impl FastServerError {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn info(&self) -> Option<&Value> {
        self.0.info.as_ref()
    }

    pub fn context(&self) -> Option<&Value> {
        self.0.context.as_ref()
    }
}

/// The caller aborted the request.
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("request aborted")]
pub struct FastRequestAbortedError;

/// Why a request did not complete successfully.
#[derive(Error, Debug, Clone)]
pub enum RequestFailure {
    #[error(transparent)]
    Server(#[from] FastServerError),

    #[error(transparent)]
    Protocol(#[from] FastProtocolError),

    #[error(transparent)]
    Transport(#[from] FastTransportError),

    #[error(transparent)]
    Aborted(#[from] FastRequestAbortedError),

    #[error("failed to allocate msgid: {0}")]
    IdsExhausted(AllocError),
}

impl RequestFailure {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RequestFailure::Aborted(_))
    }

    pub fn server_error(&self) -> Option<&FastServerError> {
        match self {
            RequestFailure::Server(e) => Some(e),
            _ => None,
        }
    }
}

/// Error delivered to the caller of a failed request.
#[derive(Error, Debug, Clone)]
#[error("request failed: {cause}")]
pub struct FastRequestError {
    pub msgid: u32,
    pub method: String,
    #[source]
    pub cause: RequestFailure,
}

impl FastRequestError {
    pub(crate) fn new(msgid: u32, method: &str, cause: RequestFailure) -> Self {
        Self {
            msgid,
            method: method.to_string(),
            cause,
        }
    }
}
