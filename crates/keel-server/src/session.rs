//! Sessions and authentication
//!
//! A session binds an opaque token to a user, a sandbox and a mutable JSON
//! context. Sessions live in an in-memory table and in the `Session` storage
//! table; a worker that has never seen a token restores it from storage.
//! The in-memory table is bounded: past its capacity, sessions no caller
//! holds are evicted, least recently used first, and restored again on
//! their next call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use keel_common::transport::cookie;
use keel_common::{KeelError, Result};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde_json::{json, Map, Value};

use crate::capabilities::Capabilities;
use crate::identity::TransportIdentity;
use crate::sandbox::{Sandbox, SandboxPool};
use crate::security::Hashing;
use crate::storage::{conditions, Record, Storage};

pub const SESSION_TABLE: &str = "Session";
pub const USER_TABLE: &str = "SystemUser";

pub const TOKEN_LENGTH: usize = 32;

/// Sessions kept in memory per worker before idle ones are evicted.
pub const SESSION_CAPACITY: usize = 10_000;

const ALPHA_DIGIT: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of 62 that fits in a byte. Bytes at or above it are
/// discarded so every character is equally likely.
const REJECT_FROM: u8 = 248;

/// Generates a session token from OS randomness.
pub fn generate_token() -> String {
    let mut token = String::with_capacity(TOKEN_LENGTH);
    let mut buf = [0u8; 2 * TOKEN_LENGTH];
    while token.len() < TOKEN_LENGTH {
        OsRng.fill_bytes(&mut buf);
        for byte in buf {
            if byte >= REJECT_FROM {
                continue;
            }
            token.push(ALPHA_DIGIT[(byte % 62) as usize] as char);
            if token.len() == TOKEN_LENGTH {
                break;
            }
        }
    }
    token
}

fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub struct Session {
    token: String,
    user_id: i64,
    ip: String,
    context: Mutex<Map<String, Value>>,
    sandbox: Arc<Sandbox>,
    storage: Arc<dyn Storage>,
    write_lock: tokio::sync::Mutex<()>,
    revoked: AtomicBool,
    persisted: AtomicBool,
    last_used: AtomicU64,
}

impl Session {
    fn new(
        token: String,
        user_id: i64,
        ip: String,
        context: Map<String, Value>,
        sandbox: Arc<Sandbox>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            token,
            user_id,
            ip,
            context: Mutex::new(context),
            sandbox,
            storage,
            write_lock: tokio::sync::Mutex::new(()),
            revoked: AtomicBool::new(false),
            persisted: AtomicBool::new(false),
            last_used: AtomicU64::new(0),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Snapshot of the session context.
    pub fn context(&self) -> Map<String, Value> {
        self.context.lock().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.context.lock().get(key).cloned()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Sets `key` and persists the whole context. The new value becomes
    /// visible only after storage accepted it.
    ///
    /// A session whose record is gone, e.g. signed out through another
    /// worker, is marked revoked and the update fails with `Forbidden`.
    pub async fn update(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.is_revoked() {
            return Err(KeelError::Forbidden("session revoked".into()));
        }

        let mut next = self.context.lock().clone();
        next.insert(key.to_string(), value);
        let data = serde_json::to_string(&next)?;

        let delta = record(json!({ "data": data }));
        let changed = self
            .storage
            .update(SESSION_TABLE, delta, &conditions([("token", json!(self.token))]))
            .await?;
        if changed == 0 {
            self.revoked.store(true, Ordering::Release);
            tracing::warn!(user_id = self.user_id, "Session record missing, revoking session");
            return Err(KeelError::Forbidden("session revoked".into()));
        }

        *self.context.lock() = next;
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("ip", &self.ip)
            .field("sandbox", &self.sandbox.id())
            .finish()
    }
}

/// A stored user as needed for sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub password: String,
}

pub struct SessionStore {
    storage: Arc<dyn Storage>,
    hashing: Arc<dyn Hashing>,
    pool: Arc<SandboxPool>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    capacity: usize,
    clock: AtomicU64,
}

impl SessionStore {
    pub fn new(capabilities: &Capabilities, pool: Arc<SandboxPool>) -> Self {
        Self::with_capacity(capabilities, pool, SESSION_CAPACITY)
    }

    pub fn with_capacity(capabilities: &Capabilities, pool: Arc<SandboxPool>, capacity: usize) -> Self {
        Self {
            storage: capabilities.storage().clone(),
            hashing: capabilities.hashing().clone(),
            pool,
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn touch(&self, session: &Session) {
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        session.last_used.store(now, Ordering::Relaxed);
    }

    /// Makes room for one more session. Only sessions referenced by nothing
    /// but the table are evicted, so no live connection or running call
    /// ends up with a copy that diverges from a later restore.
    fn make_room(&self, sessions: &mut HashMap<String, Arc<Session>>) {
        sessions.retain(|_, session| !session.is_revoked());
        while sessions.len() >= self.capacity {
            let idle = sessions
                .iter()
                .filter(|(_, session)| Arc::strong_count(session) == 1)
                .min_by_key(|(_, session)| session.last_used.load(Ordering::Relaxed))
                .map(|(token, _)| token.clone());
            let Some(token) = idle else {
                tracing::warn!(sessions = sessions.len(), "Session table over capacity, none idle");
                return;
            };
            sessions.remove(&token);
        }
    }

    /// Creates and persists a session for `user_id` and hands the caller
    /// its credential.
    pub async fn start(&self, transport: &TransportIdentity, user_id: i64) -> Result<Arc<Session>> {
        let token = loop {
            let candidate = generate_token();
            if !self.sessions.lock().contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session::new(
            token.clone(),
            user_id,
            transport.ip(),
            Map::new(),
            self.pool.take(),
            self.storage.clone(),
        );
        self.storage
            .insert(
                SESSION_TABLE,
                record(json!({
                    "token": token,
                    "user_id": user_id,
                    "ip": session.ip,
                    "data": "{}",
                })),
            )
            .await?;
        session.persisted.store(true, Ordering::Release);

        let session = Arc::new(session);
        self.touch(&session);
        {
            let mut sessions = self.sessions.lock();
            self.make_room(&mut sessions);
            sessions.insert(token.clone(), session.clone());
        }
        transport.cache_session(session.clone());
        transport.push_cookie(cookie::session_cookie(&token, transport.host()));

        tracing::debug!(user_id, ip = %session.ip, "Session started");
        Ok(session)
    }

    /// Resolves the caller's session: transport cache, then the in-memory
    /// table, then storage. `None` means an anonymous caller.
    pub async fn restore(&self, transport: &TransportIdentity) -> Result<Option<Arc<Session>>> {
        if let Some(session) = transport.cached_session() {
            return Ok(Some(session));
        }

        let Some(token) = transport.credential() else {
            return Ok(None);
        };
        if !is_well_formed(&token) {
            return Ok(None);
        }

        let known = self.sessions.lock().get(&token).cloned();
        if let Some(session) = known.filter(|s| !s.is_revoked()) {
            self.touch(&session);
            transport.cache_session(session.clone());
            return Ok(Some(session));
        }

        let rows = self
            .storage
            .select(
                SESSION_TABLE,
                &["user_id", "ip", "data"],
                &conditions([("token", json!(token))]),
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let Some(user_id) = row.get("user_id").and_then(Value::as_i64) else {
            tracing::warn!("Session record without a user id");
            return Ok(None);
        };
        let context = row
            .get("data")
            .and_then(Value::as_str)
            .and_then(|data| serde_json::from_str::<Map<String, Value>>(data).ok())
            .unwrap_or_default();
        let ip = row
            .get("ip")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| transport.ip());

        // A concurrent restore of the same token may have won while storage
        // was read; take a sandbox only when this one inserts.
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&token).filter(|s| !s.is_revoked()) {
                Some(existing) => existing.clone(),
                None => {
                    let restored = Session::new(
                        token.clone(),
                        user_id,
                        ip,
                        context,
                        self.pool.take(),
                        self.storage.clone(),
                    );
                    restored.persisted.store(true, Ordering::Release);
                    let restored = Arc::new(restored);
                    self.make_room(&mut sessions);
                    sessions.insert(token, restored.clone());
                    restored
                }
            }
        };
        self.touch(&session);
        transport.cache_session(session.clone());

        tracing::debug!(user_id, "Session restored from storage");
        Ok(Some(session))
    }

    /// Revokes `token` everywhere this worker can reach and tells the
    /// caller to drop its credential.
    pub async fn remove(&self, transport: &TransportIdentity, token: &str) -> Result<()> {
        transport.push_cookie(cookie::delete_cookie(transport.host()));
        transport.forget_session();

        if let Some(session) = self.sessions.lock().remove(token) {
            session.revoked.store(true, Ordering::Release);
        }
        self.storage
            .delete(SESSION_TABLE, &conditions([("token", json!(token))]))
            .await?;
        Ok(())
    }

    pub async fn register_user(&self, login: &str, password: &str, full_name: &str) -> Result<Value> {
        if self.get_user(login).await?.is_some() {
            return Err(KeelError::Method("User already exists".into()));
        }
        let hash = self.hashing.hash(password).await?;
        self.storage
            .insert(
                USER_TABLE,
                record(json!({
                    "login": login,
                    "password": hash,
                    "full_name": full_name,
                })),
            )
            .await
    }

    pub async fn get_user(&self, login: &str) -> Result<Option<User>> {
        let rows = self
            .storage
            .select(USER_TABLE, &["id", "password"], &conditions([("login", json!(login))]))
            .await?;
        Ok(rows.into_iter().next().and_then(|row| {
            Some(User {
                id: row.get("id")?.as_i64()?,
                password: row.get("password")?.as_str()?.to_string(),
            })
        }))
    }

    /// Checks credentials and returns the user id on success.
    ///
    /// An unknown login is verified against a dummy hash so it costs the
    /// same as a wrong password.
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<Option<i64>> {
        let user = self.get_user(login).await?;
        let hash = user
            .as_ref()
            .map(|u| u.password.as_str())
            .unwrap_or_else(|| self.hashing.dummy_hash());
        let valid = self.hashing.verify(password, hash).await?;
        Ok(match user {
            Some(user) if valid => Some(user.id),
            _ => None,
        })
    }

    /// Sessions currently held in memory.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}
