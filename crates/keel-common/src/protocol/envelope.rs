//! Keel wire envelopes
//!
//! Every unit on the wire is a JSON object whose key set determines its kind:
//!
//! | Kind     | Shape                                     |
//! |----------|-------------------------------------------|
//! | Call     | `{"call": <id>, "<target>": <args>}`        |
//! | Success  | `{"callback": <id>, "result": <value>}`     |
//! | Error    | `{"callback": <id>, "error": {code, message}}` |
//! | Event    | `{"event": <name>, "<target>": <payload>}`  |
//! | Token    | `{"token": "<session token>"}`            |
//!
//! The token packet is only meaningful on persistent connections, where it
//! attaches a session credential to the connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{reason_phrase, KeelError, Result};

/// Connection-scoped call correlation id.
///
/// Request/response transports use an implicit id of `1`.
pub type CallId = u64;

/// A method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub id: CallId,
    pub target: String,
    pub args: Value,
}

impl CallEnvelope {
    pub fn new(id: CallId, target: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            target: target.into(),
            args,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(2);
        map.insert("call".into(), Value::from(self.id));
        map.insert(self.target.clone(), self.args.clone());
        Value::Object(map)
    }
}

/// Error body carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error body with the standard reason phrase for `code`.
    pub fn from_code(code: u16) -> Self {
        Self::new(code, reason_phrase(code))
    }
}

impl From<ErrorBody> for KeelError {
    fn from(body: ErrorBody) -> Self {
        KeelError::Remote {
            code: body.code,
            message: body.message,
        }
    }
}

impl From<&KeelError> for ErrorBody {
    fn from(err: &KeelError) -> Self {
        Self::new(err.code(), err.public_message())
    }
}

/// Reply to a call, correlated by `callback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub callback: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    pub fn success(callback: CallId, result: Value) -> Self {
        Self {
            callback,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(callback: CallId, error: impl Into<ErrorBody>) -> Self {
        Self {
            callback,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Error response built from a [`KeelError`] using only its public message.
    pub fn failure(callback: CallId, err: &KeelError) -> Self {
        Self::error(callback, ErrorBody::from(err))
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The result, or the carried error as [`KeelError::Remote`].
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing a struct of JSON values cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Server push on a persistent connection. Not correlated to any call.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub name: String,
    pub target: String,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(2);
        map.insert("event".into(), Value::String(self.name.clone()));
        map.insert(self.target.clone(), self.payload.clone());
        Value::Object(map)
    }
}

/// A classified wire packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Call(CallEnvelope),
    Response(ResponseEnvelope),
    Event(EventEnvelope),
    Token(String),
}

impl Packet {
    /// Classifies a decoded JSON value by its key set.
    ///
    /// Anything that does not match exactly one shape is a
    /// [`KeelError::Structural`] error.
    pub fn classify(value: Value) -> Result<Packet> {
        let Value::Object(mut map) = value else {
            return Err(KeelError::Structural("packet is not an object".into()));
        };

        if let Some(id) = map.remove("call") {
            let id = parse_id(&id, "call")?;
            if id == 0 {
                return Err(KeelError::Structural(
                    "call id 0 is reserved for uncorrelated replies".into(),
                ));
            }
            let (target, args) = single_entry(map, "call")?;
            return Ok(Packet::Call(CallEnvelope { id, target, args }));
        }

        if let Some(id) = map.remove("callback") {
            let callback = parse_id(&id, "callback")?;
            if map.len() != 1 {
                return Err(KeelError::Structural(
                    "callback packet must carry exactly one of result or error".into(),
                ));
            }
            if let Some(result) = map.remove("result") {
                return Ok(Packet::Response(ResponseEnvelope::success(callback, result)));
            }
            if let Some(error) = map.remove("error") {
                let body: ErrorBody = serde_json::from_value(error)
                    .map_err(|e| KeelError::Structural(format!("invalid error body: {}", e)))?;
                return Ok(Packet::Response(ResponseEnvelope::error(callback, body)));
            }
            return Err(KeelError::Structural("unknown callback packet".into()));
        }

        if let Some(name) = map.remove("event") {
            let Value::String(name) = name else {
                return Err(KeelError::Structural("event name must be a string".into()));
            };
            let (target, payload) = single_entry(map, "event")?;
            return Ok(Packet::Event(EventEnvelope { name, target, payload }));
        }

        if map.len() == 1 {
            if let Some(Value::String(token)) = map.remove("token") {
                return Ok(Packet::Token(token));
            }
        }

        Err(KeelError::Structural("unknown packet kind".into()))
    }

    /// Parses raw bytes and classifies the result.
    pub fn from_slice(bytes: &[u8]) -> Result<Packet> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| KeelError::Structural(format!("invalid JSON: {}", e)))?;
        Self::classify(value)
    }

    pub fn to_value(&self) -> Value {
        match self {
            Packet::Call(call) => call.to_value(),
            Packet::Response(response) => response.to_value(),
            Packet::Event(event) => event.to_value(),
            Packet::Token(token) => serde_json::json!({ "token": token }),
        }
    }
}

fn parse_id(value: &Value, key: &str) -> Result<CallId> {
    value
        .as_u64()
        .ok_or_else(|| KeelError::Structural(format!("{} id must be a non-negative integer", key)))
}

fn single_entry(map: Map<String, Value>, kind: &str) -> Result<(String, Value)> {
    if map.len() != 1 {
        return Err(KeelError::Structural(format!(
            "{} packet must name exactly one target, found {}",
            kind,
            map.len()
        )));
    }
    map.into_iter()
        .next()
        .ok_or_else(|| KeelError::Structural(format!("{} packet has no target", kind)))
}

/// Best-effort call id from an unparseable packet, used to correlate a
/// structural error. Falls back to `0`.
pub fn salvage_call_id(bytes: &[u8]) -> CallId {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("call").and_then(Value::as_u64))
        .unwrap_or(0)
}
