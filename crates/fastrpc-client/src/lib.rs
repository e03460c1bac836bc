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

//! # FastRPC Client
//!
//! Issues Fast protocol RPC calls over a single byte stream.
//!
//! Many calls may be outstanding at once; each gets its own msgid and its
//! own [`RpcRequest`] handle, which is a [`Stream`](futures_util::Stream)
//! of result items ending either cleanly or with exactly one
//! [`FastRequestError`].
//!
//! Any problem with the stream itself (a socket error, a protocol
//! violation by the server, an unexpected end of input, or an explicit
//! [`FastClient::detach`]) fails the whole client: every outstanding
//! request fails with the same cause, and later calls fail immediately.
//!
//! ## Example
//!
//! ```no_run
//! use fastrpc_client::{ClientConfig, FastClient};
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FastClient::connect_tcp("127.0.0.1:2030", ClientConfig::default()).await?;
//!
//! let mut request = client.rpc("echo", vec![json!("hello"), json!("world")]);
//! while let Some(item) = request.next().await {
//!     println!("{}", item?);
//! }
//!
//! // Or gather everything at once.
//! let items = client.rpc("echo", vec![json!(1)]).collect_items().await?;
//! assert_eq!(items, vec![json!({ "value": 1 })]);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod request;

pub use client::{ClientConfig, FastClient, RecentOutcome, RecentRequest};
pub use error::{FastRequestAbortedError, FastRequestError, FastServerError, RequestFailure};
pub use request::RpcRequest;
