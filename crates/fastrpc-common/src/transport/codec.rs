use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, XMODEM};
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{
    FastMessage, FastProtocolError, FastStatus, FP_HEADER_SZ, FP_MSGID_MAX, FP_OFF_CRC,
    FP_OFF_DATALEN, FP_OFF_MSGID, FP_OFF_STATUS, FP_OFF_TYPE, FP_OFF_VERSION, FP_TYPE_JSON,
    FP_VERSION_1,
};

/// Upper bound on buffer space reserved ahead of payload bytes arriving.
const MAX_RESERVE: usize = 64 * 1024;

/// Error produced while reading a stream.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Protocol(#[from] FastProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Error produced while writing a message.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("msg.msgid is too big ({0})")]
    MsgidTooBig(u32),

    #[error("msg.data must be a JSON object or array")]
    BadData,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload of {0} bytes does not fit in a message")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// CRC-16/XMODEM of a payload, as carried in the header.
pub fn payload_crc(payload: &[u8]) -> u32 {
    State::<XMODEM>::calculate(payload) as u32
}

/// Appends the wire form of `msg` to `dst`.
///
/// # Errors
///
/// Rejects msgids above [`FP_MSGID_MAX`] and data that is neither a JSON
/// object nor an array. Nothing is written to `dst` on error.
pub fn encode_message(msg: &FastMessage, dst: &mut BytesMut) -> Result<(), EncodeError> {
    if msg.msgid > FP_MSGID_MAX {
        return Err(EncodeError::MsgidTooBig(msg.msgid));
    }
    if !(msg.data.is_object() || msg.data.is_array()) {
        return Err(EncodeError::BadData);
    }

    let payload = serde_json::to_vec(&msg.data)?;
    let datalen =
        u32::try_from(payload.len()).map_err(|_| EncodeError::PayloadTooLarge(payload.len()))?;

    dst.reserve(FP_HEADER_SZ + payload.len());
    dst.put_u8(FP_VERSION_1);
    dst.put_u8(FP_TYPE_JSON);
    dst.put_u8(msg.status.as_u8());
    dst.put_u32(msg.msgid);
    dst.put_u32(payload_crc(&payload));
    dst.put_u32(datalen);
    dst.put_slice(&payload);
    Ok(())
}

/// Stateless encoder for [`FastMessage`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastMessageEncoder;

impl Encoder<FastMessage> for FastMessageEncoder {
    type Error = EncodeError;

    fn encode(&mut self, item: FastMessage, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_message(&item, dst)
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    status: FastStatus,
    msgid: u32,
    crc: u32,
    datalen: usize,
}

#[derive(Debug)]
enum DecodeState {
    Header,
    Payload(FrameHeader),
    Failed,
}

/// Incremental decoder for Fast protocol streams.
///
/// Input may arrive in arbitrary fragments; the decoder buffers until a full
/// header and then a full payload are available. Validation happens in wire
/// order (version, type, status, msgid, size, CRC, JSON, payload shape) and
/// the first failure is terminal: afterwards the decoder yields nothing, not
/// even at end-of-stream.
#[derive(Debug)]
pub struct FastMessageDecoder {
    state: DecodeState,
    max_message_size: Option<usize>,
}

impl Default for FastMessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FastMessageDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            max_message_size: None,
        }
    }

    /// Rejects payloads larger than `max` bytes with
    /// [`FastProtocolError::MessageTooLarge`].
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }

    /// Returns `true` once the decoder has reported an error.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, DecodeState::Failed)
    }

    fn fail(&mut self, err: FastProtocolError) -> CodecError {
        self.state = DecodeState::Failed;
        CodecError::Protocol(err)
    }

    fn parse_header(&self, src: &[u8]) -> Result<FrameHeader, FastProtocolError> {
        let read_u32 = |offset: usize| {
            u32::from_be_bytes([src[offset], src[offset + 1], src[offset + 2], src[offset + 3]])
        };

        let version = src[FP_OFF_VERSION];
        if version != FP_VERSION_1 {
            return Err(FastProtocolError::UnsupportedVersion { found: version });
        }

        let kind = src[FP_OFF_TYPE];
        if kind != FP_TYPE_JSON {
            return Err(FastProtocolError::UnsupportedType { found: kind });
        }

        let status = FastStatus::try_from(src[FP_OFF_STATUS])
            .map_err(|found| FastProtocolError::UnsupportedStatus { found })?;

        let msgid = read_u32(FP_OFF_MSGID);
        if msgid > FP_MSGID_MAX {
            return Err(FastProtocolError::InvalidMsgid { found: msgid });
        }

        let datalen = read_u32(FP_OFF_DATALEN) as usize;
        if let Some(max) = self.max_message_size {
            if datalen > max {
                return Err(FastProtocolError::MessageTooLarge { size: datalen, max });
            }
        }

        Ok(FrameHeader {
            status,
            msgid,
            crc: read_u32(FP_OFF_CRC),
            datalen,
        })
    }
}

fn parse_payload(header: &FrameHeader, payload: &[u8]) -> Result<FastMessage, FastProtocolError> {
    let calculated = payload_crc(payload);
    if calculated != header.crc {
        return Err(FastProtocolError::BadCrc {
            expected: header.crc,
            calculated,
        });
    }

    let data: Value = serde_json::from_slice(payload)
        .map_err(|e| FastProtocolError::InvalidJson(e.to_string()))?;

    // JSON arrays count as objects here; they simply have no "d" member.
    if !(data.is_object() || data.is_array()) {
        return Err(FastProtocolError::BadData);
    }

    match header.status {
        FastStatus::Data | FastStatus::End => {
            if !data.get("d").is_some_and(Value::is_array) {
                return Err(FastProtocolError::BadDataD);
            }
        }
        FastStatus::Error => {
            let d = data.get("d");
            let has_string = |key: &str| d.and_then(|d| d.get(key)).is_some_and(Value::is_string);
            if !(has_string("name") && has_string("message")) {
                return Err(FastProtocolError::BadError);
            }
        }
    }

    Ok(FastMessage::new(header.msgid, header.status, data))
}

impl Decoder for FastMessageDecoder {
    type Item = FastMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FastMessage>, CodecError> {
        let header = match self.state {
            DecodeState::Failed => return Ok(None),
            DecodeState::Payload(header) => header,
            DecodeState::Header => {
                if src.len() < FP_HEADER_SZ {
                    return Ok(None);
                }
                let header = match self.parse_header(&src[..FP_HEADER_SZ]) {
                    Ok(header) => header,
                    Err(e) => return Err(self.fail(e)),
                };
                src.advance(FP_HEADER_SZ);
                self.state = DecodeState::Payload(header);
                header
            }
        };

        if src.len() < header.datalen {
            // The declared length is untrusted; grow with the data instead.
            src.reserve((header.datalen - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        let payload = src.split_to(header.datalen);
        match parse_payload(&header, &payload) {
            Ok(msg) => {
                self.state = DecodeState::Header;
                Ok(Some(msg))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FastMessage>, CodecError> {
        if let Some(msg) = self.decode(buf)? {
            return Ok(Some(msg));
        }

        match self.state {
            DecodeState::Failed => Ok(None),
            DecodeState::Header if buf.is_empty() => Ok(None),
            _ => Err(self.fail(FastProtocolError::IncompleteMessage)),
        }
    }
}
