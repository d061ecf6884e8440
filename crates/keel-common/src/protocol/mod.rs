pub mod envelope;
pub mod error;

#[cfg(test)]
mod tests;

pub use envelope::{
    salvage_call_id, CallEnvelope, CallId, ErrorBody, EventEnvelope, Packet, ResponseEnvelope,
};
pub use error::{KeelError, Result};
