//! Keel transport layer
//!
//! - **[`codec`]**: length-prefixed JSON frames for persistent connections
//! - **[`http`]**: response builders for the HTTP surface
//! - **[`cookie`]**: session credential cookies

pub mod codec;
pub mod cookie;
pub mod http;

pub use codec::{read_frame, write_frame, write_value, JsonCodec, MAX_FRAME_SIZE};
pub use http::{HttpTransport, HyperRequest, HyperResponse};
