// Copyright 2025 Keel Authors
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

//! # Keel CLI
//!
//! Command-line interface for the Keel application server.
//!
//! The same binary plays every part of a deployment:
//!
//! - **Supervisor**: `keel serve` plans the worker slots from the
//!   configuration and keeps one child process per slot alive
//! - **Workers**: `keel worker` is what the supervisor spawns; it reads its
//!   configuration from the environment and its control messages from stdin
//! - **Client**: `keel call` makes one RPC call over HTTP and prints the
//!   result as JSON
//!
//! ## Architecture
//!
//! Arguments are parsed with `argh` in the binary. The worker entry points
//! live here so they can be driven from tests with an in-memory control
//! input instead of the process stdin.

pub mod worker;

pub use worker::{config_from_env, run_balancer, run_worker, shutdown_signal, wait_for_stop};
