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

//! # FastRPC CLI
//!
//! Command-line front end for the Fast protocol crates.
//!
//! - `fastrpc serve`: run a server exposing the demo methods in [`demo`]
//! - `fastrpc call`: make one RPC call and print each result item as a line
//!   of JSON
//!
//! The demo methods are also what the end-to-end tests run against.

pub mod demo;
