use thiserror::Error;

/// Error taxonomy shared by every Keel component.
///
/// Each variant maps onto a wire code (see [`KeelError::code`]). Only
/// [`KeelError::public_message`] is ever sent to a caller; the `Display`
/// text may carry internal detail and is meant for server-side logs.
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Malformed packet: {0}")]
    Structural(String),

    #[error("Method not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Admission queue is full")]
    QueueFull,

    #[error("Internal error: {0}")]
    Internal(String),

    /// Business error raised by a method. Its message is safe to surface.
    #[error("{0}")]
    Method(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Error reported by the other end of a call.
    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeelError {
    /// Wire code carried in `error.code`.
    pub fn code(&self) -> u16 {
        match self {
            KeelError::Structural(_) | KeelError::Json(_) => 400,
            KeelError::Method(_) => 400,
            KeelError::Forbidden(_) => 403,
            KeelError::NotFound(_) => 404,
            KeelError::Timeout(_) | KeelError::QueueFull => 504,
            KeelError::Remote { code, .. } => *code,
            KeelError::Internal(_)
            | KeelError::Transport(_)
            | KeelError::Storage(_)
            | KeelError::Io(_) => 500,
        }
    }

    /// Message that may leave the process.
    ///
    /// Everything except [`KeelError::Method`] collapses to the reason phrase
    /// of its code, so internal detail never reaches a caller.
    pub fn public_message(&self) -> String {
        match self {
            KeelError::Method(message) | KeelError::Remote { message, .. } => message.clone(),
            other => reason_phrase(other.code()).to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code() == 504
    }
}

/// Standard reason phrase for the codes Keel emits.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
