use std::sync::atomic::{AtomicU64, Ordering};

use keel_common::transport::cookie::{self, TOKEN_COOKIE};
use keel_common::{CallEnvelope, KeelError, ResponseEnvelope, Result};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use serde_json::Value;

/// Keel client over HTTP.
///
/// Remembers the session token the server hands out in `Set-Cookie` and
/// sends it back on later calls, the way a browser would.
pub struct HttpClient {
    endpoint: String,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpClient {
    /// Client for the server at `base_url` (e.g. `http://127.0.0.1:3331`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base = base_url.into();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| KeelError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: format!("{}/api", base.trim_end_matches('/')),
            http,
            token: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.lock() = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    /// Calls `method` and returns its result. Errors reported by the server
    /// come back as [`KeelError::Remote`].
    pub async fn call(&self, method: impl Into<String>, args: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&CallEnvelope::new(id, method, args))
            .await?
            .into_result()
    }

    /// Sends one envelope and returns the server's reply envelope as is.
    pub async fn send(&self, call: &CallEnvelope) -> Result<ResponseEnvelope> {
        let body = serde_json::to_vec(&call.to_value())?;
        self.post(body).await
    }

    /// Posts raw bytes to `/api`.
    pub async fn post(&self, body: Vec<u8>) -> Result<ResponseEnvelope> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = self.token() {
            request = request.header(COOKIE, format!("{}={}", TOKEN_COOKIE, token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| KeelError::Transport(format!("HTTP request failed: {}", e)))?;

        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(value) = value.to_str() {
                self.apply_cookie(value);
            }
        }

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| KeelError::Transport(format!("Failed to read response: {}", e)))?;
        serde_json::from_slice::<ResponseEnvelope>(&bytes).map_err(|_| {
            KeelError::Transport(format!("Unexpected response with status {}", status))
        })
    }

    fn apply_cookie(&self, header: &str) {
        let Some((name, value)) = cookie::parse_cookies(header).into_iter().next() else {
            return;
        };
        if name != TOKEN_COOKIE {
            return;
        }
        let mut token = self.token.lock();
        if value == "deleted" {
            *token = None;
        } else {
            *token = Some(value);
        }
    }
}
