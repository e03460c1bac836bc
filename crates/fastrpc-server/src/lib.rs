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

//! # FastRPC Server
//!
//! Serves Fast protocol RPC methods over stream sockets.
//!
//! A [`FastServer`] holds a registry of named methods. Once it is handed a
//! [`Listener`], every accepted connection gets a reader task (decoding
//! requests) and a writer task (encoding responses), and a single dispatcher
//! task owns all connection and request bookkeeping. Each request is handed
//! to its method's handler as an [`RpcContext`], through which the handler
//! streams result items and then ends or fails the request.
//!
//! ## Connection lifecycle
//!
//! A connection is removed only after all of its requests have completed:
//!
//! - **End of input**: responses to outstanding requests are still written,
//!   then the socket is shut down cleanly.
//! - **Socket error** or **protocol violation**: the socket is destroyed at
//!   once; outstanding handlers keep running, but their output is discarded.
//!
//! ## Example
//!
//! ```no_run
//! use fastrpc_server::{FastServer, RpcContext, ServerConfig};
//! use serde_json::json;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = FastServer::new(ServerConfig::default());
//! server.register_rpc_method("echo", |mut ctx: RpcContext| async move {
//!     for arg in ctx.argv() {
//!         ctx.write(json!({ "value": arg })).await;
//!     }
//!     ctx.end().await;
//! })?;
//!
//! let listener = TcpListener::bind("127.0.0.1:2030").await?;
//! let handle = server.serve(listener);
//! handle.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod listener;
pub mod server;
pub mod stats;

mod connection;
mod request;

pub use context::RpcContext;
pub use listener::Listener;
pub use server::{FastServer, ServerConfig, ServerError, ServerHandle};
pub use stats::{ConnectionState, ConnectionStats, MethodStats, ServerStats};
