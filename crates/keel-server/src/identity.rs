//! Per-request or per-connection caller identity.

use std::net::SocketAddr;
use std::sync::Arc;

use keel_common::transport::cookie;
use parking_lot::Mutex;

use crate::session::Session;
use crate::socket_server::Responder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Socket,
}

/// What the session manager knows about the caller on one transport.
///
/// Holds the credential the caller presented, a cache of the session it
/// resolved to, and credential instructions (cookies) to send back.
pub struct TransportIdentity {
    kind: TransportKind,
    remote: SocketAddr,
    host: String,
    credential: Mutex<Option<String>>,
    cached: Mutex<Option<Arc<Session>>>,
    cookies: Mutex<Vec<String>>,
    responder: Option<Arc<Responder>>,
}

impl TransportIdentity {
    /// Identity for one HTTP request.
    pub fn http(remote: SocketAddr, host: Option<&str>, cookie_header: Option<&str>) -> Self {
        Self {
            kind: TransportKind::Http,
            remote,
            host: host.unwrap_or("localhost").to_string(),
            credential: Mutex::new(cookie_header.and_then(cookie::token_from_header)),
            cached: Mutex::new(None),
            cookies: Mutex::new(Vec::new()),
            responder: None,
        }
    }

    /// Identity for one persistent connection.
    pub fn socket(remote: SocketAddr, responder: Arc<Responder>) -> Self {
        Self {
            kind: TransportKind::Socket,
            remote,
            host: remote.ip().to_string(),
            credential: Mutex::new(None),
            cached: Mutex::new(None),
            cookies: Mutex::new(Vec::new()),
            responder: Some(responder),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn ip(&self) -> String {
        self.remote.ip().to_string()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn credential(&self) -> Option<String> {
        self.credential.lock().clone()
    }

    /// Attaches a credential. A different token drops the cached session.
    pub fn set_credential(&self, token: Option<String>) {
        let mut credential = self.credential.lock();
        if *credential != token {
            self.cached.lock().take();
        }
        *credential = token;
    }

    pub fn cached_session(&self) -> Option<Arc<Session>> {
        let mut cached = self.cached.lock();
        if cached.as_ref().is_some_and(|s| s.is_revoked()) {
            cached.take();
        }
        cached.clone()
    }

    pub fn cache_session(&self, session: Arc<Session>) {
        *self.credential.lock() = Some(session.token().to_string());
        *self.cached.lock() = Some(session);
    }

    pub fn forget_session(&self) {
        self.cached.lock().take();
        self.credential.lock().take();
    }

    /// Queues a `Set-Cookie` value. Only HTTP responses carry them.
    pub fn push_cookie(&self, cookie: String) {
        if self.kind == TransportKind::Http {
            self.cookies.lock().push(cookie);
        }
    }

    pub fn take_cookies(&self) -> Vec<String> {
        std::mem::take(&mut *self.cookies.lock())
    }

    pub fn responder(&self) -> Option<&Arc<Responder>> {
        self.responder.as_ref()
    }
}

impl std::fmt::Debug for TransportIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIdentity")
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .field("host", &self.host)
            .finish()
    }
}
