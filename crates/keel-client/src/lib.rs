//! Keel client
//!
//! - [`HttpClient`] posts call envelopes to `/api` and keeps the session
//!   cookie between calls
//! - [`SocketClient`] holds one persistent framed connection, multiplexes
//!   concurrent calls over it and receives pushed events

pub mod http;
pub mod socket;

pub use http::HttpClient;
pub use socket::SocketClient;
