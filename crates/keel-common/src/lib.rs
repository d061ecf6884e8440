//! Keel common types
//!
//! Shared by every Keel component:
//!
//! - [`protocol`] - wire envelopes and the [`KeelError`] taxonomy
//! - [`transport`] - length-prefixed framing, HTTP response helpers, cookies
//! - [`semaphore`] - the admission semaphore gating RPC execution
//! - [`config`] - [`ServerConfig`] and its defaults
//!
//! # Example
//!
//! ```
//! use keel_common::{Packet, ResponseEnvelope};
//! use serde_json::json;
//!
//! let packet = Packet::classify(json!({"call": 1, "status": {}})).unwrap();
//! if let Packet::Call(call) = packet {
//!     let reply = ResponseEnvelope::success(call.id, json!({"ok": true}));
//!     assert_eq!(reply.callback, 1);
//! }
//! ```

pub mod config;
pub mod protocol;
pub mod semaphore;
pub mod transport;

pub use config::{ServerConfig, WorkerRole};
pub use protocol::*;
pub use semaphore::{AdmissionSemaphore, Permit};
