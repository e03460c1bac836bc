//! Fast protocol message types.
//!
//! This module defines the wire constants, the [`FastMessage`] value that
//! the codec produces and consumes, and the error taxonomy shared by the
//! server and the client.

pub mod error;
pub mod message;


pub use error::{FastProtocolError, FastTransportError};
pub use message::{FastMessage, FastStatus, RpcError};

/// Protocol version carried in every header.
pub const FP_VERSION_1: u8 = 0x1;

/// The only supported payload encoding.
pub const FP_TYPE_JSON: u8 = 0x1;

/// Largest msgid allowed on the wire (2^31 - 1).
pub const FP_MSGID_MAX: u32 = i32::MAX as u32;

/// Size of the fixed header preceding every payload.
pub const FP_HEADER_SZ: usize = 15;

pub const FP_OFF_VERSION: usize = 0;
pub const FP_OFF_TYPE: usize = FP_OFF_VERSION + 1;
pub const FP_OFF_STATUS: usize = FP_OFF_TYPE + 1;
pub const FP_OFF_MSGID: usize = FP_OFF_STATUS + 1;
pub const FP_OFF_CRC: usize = FP_OFF_MSGID + 4;
pub const FP_OFF_DATALEN: usize = FP_OFF_CRC + 4;
pub const FP_OFF_DATA: usize = FP_OFF_DATALEN + 4;
