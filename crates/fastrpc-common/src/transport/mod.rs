//! Framing for Fast protocol byte streams.
//!
//! [`FastMessageDecoder`] and [`FastMessageEncoder`] plug into
//! `tokio_util::codec::{FramedRead, FramedWrite}` on any async byte stream
//! (TCP, Unix sockets, in-memory duplex pipes).

pub mod codec;


pub use codec::{encode_message, CodecError, EncodeError, FastMessageDecoder, FastMessageEncoder};
