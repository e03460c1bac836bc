// Copyright 2025 FastRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FastRPC Common Types and Transport
//!
//! This crate provides the wire protocol definitions and the framing codec
//! shared by the FastRPC server and client.
//!
//! # Overview
//!
//! Every message on the wire is a fixed 15-byte header followed by a JSON
//! payload:
//!
//! ```text
//! offset  size  field
//! 0       1     version   (always 1)
//! 1       1     type      (always 1, JSON)
//! 2       1     status    (1 DATA, 2 END, 3 ERROR)
//! 3       4     msgid     (u32 big-endian, at most 2^31 - 1)
//! 7       4     crc       (CRC-16/XMODEM of the payload, zero-extended)
//! 11      4     datalen   (u32 big-endian)
//! 15      N     payload   (UTF-8 JSON)
//! ```
//!
//! # Components
//!
//! - [`protocol`] - message, status and error types
//! - [`transport`] - tokio-util decoder and encoder for the wire format
//! - [`allocator`] - cyclic id allocation used for msgids and connection ids
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use fastrpc_common::{FastMessage, FastMessageDecoder, encode_message};
//! use serde_json::json;
//! use tokio_util::codec::Decoder;
//!
//! let call = FastMessage::rpc_call(1, "echo", vec![json!("hello")]);
//! let mut buf = BytesMut::new();
//! encode_message(&call, &mut buf).unwrap();
//!
//! let decoded = FastMessageDecoder::new().decode(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded, call);
//! ```

pub mod allocator;
pub mod protocol;
pub mod transport;

pub use allocator::{AllocError, IdAllocator};
pub use protocol::*;
pub use transport::*;
