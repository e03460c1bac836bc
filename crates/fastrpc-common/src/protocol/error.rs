use std::io;
use std::sync::Arc;
use thiserror::Error;

use super::FastStatus;

/// A violation of the wire protocol.
///
/// Decoder errors are fatal for the stream they came from. The last four
/// variants are raised by the server and the client when a well-formed
/// message makes no sense in context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FastProtocolError {
    #[error("fast protocol: unsupported version {found}")]
    UnsupportedVersion { found: u8 },

    #[error("fast protocol: unsupported type 0x{found:x}")]
    UnsupportedType { found: u8 },

    #[error("fast protocol: unsupported status 0x{found:x}")]
    UnsupportedStatus { found: u8 },

    #[error("fast protocol: invalid msgid {found}")]
    InvalidMsgid { found: u32 },

    #[error("fast protocol: message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("fast protocol: expected CRC {expected}, found {calculated}")]
    BadCrc { expected: u32, calculated: u32 },

    #[error("fast protocol: invalid JSON in \"data\": {0}")]
    InvalidJson(String),

    #[error("fast protocol: message data must be a non-null object")]
    BadData,

    #[error("fast protocol: data.d for DATA and END messages must be an array")]
    BadDataD,

    #[error("fast protocol: data.d for ERROR messages must have name and message")]
    BadError,

    #[error("fast protocol: incomplete message at end-of-stream")]
    IncompleteMessage,

    #[error("fast protocol: received message with unknown msgid {msgid}")]
    UnknownMsgid { msgid: u32 },

    #[error("unexpected end of transport stream")]
    UnexpectedEnd,

    #[error("unexpected {status} event from client")]
    UnexpectedStatus { status: FastStatus },

    #[error("client attempted to re-use msgid {msgid}")]
    DuplicateMsgid { msgid: u32 },
}

impl FastProtocolError {
    /// Stable machine-readable tag for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            FastProtocolError::UnsupportedVersion { .. } => "unsupported_version",
            FastProtocolError::UnsupportedType { .. } => "unsupported_type",
            FastProtocolError::UnsupportedStatus { .. } => "unsupported_status",
            FastProtocolError::InvalidMsgid { .. } => "invalid_msgid",
            FastProtocolError::MessageTooLarge { .. } => "message_too_large",
            FastProtocolError::BadCrc { .. } => "bad_crc",
            FastProtocolError::InvalidJson(_) => "invalid_json",
            FastProtocolError::BadData => "bad_data",
            FastProtocolError::BadDataD => "bad_data_d",
            FastProtocolError::BadError => "bad_error",
            FastProtocolError::IncompleteMessage => "incomplete_message",
            FastProtocolError::UnknownMsgid { .. } => "unknown_msgid",
            FastProtocolError::UnexpectedEnd => "unexpected_end",
            FastProtocolError::UnexpectedStatus { .. } => "unexpected_status",
            FastProtocolError::DuplicateMsgid { .. } => "duplicate_msgid",
        }
    }
}

/// A failure of the underlying byte stream rather than of its contents.
#[derive(Error, Debug, Clone)]
pub enum FastTransportError {
    #[error("client detached from transport")]
    Detached,

    #[error("transport detached")]
    TransportDetached,

    #[error("connection closed before the request completed")]
    Disconnected,

    #[error("unexpected error on transport: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for FastTransportError {
    fn from(err: io::Error) -> Self {
        FastTransportError::Io(Arc::new(err))
    }
}
