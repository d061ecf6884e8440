//! Method contract and the per-worker method table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_common::{EventEnvelope, KeelError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::Capabilities;
use crate::identity::TransportIdentity;
use crate::sandbox::Sandbox;
use crate::session::Session;

/// Who may call a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    Authenticated,
}

impl Access {
    pub fn parse(raw: &str) -> Option<Access> {
        match raw {
            "public" => Some(Access::Public),
            "authenticated" => Some(Access::Authenticated),
            _ => None,
        }
    }
}

/// A callable unit in the method table.
///
/// Implementations only reach the outside world through the
/// [`CallContext`] they are handed.
#[async_trait]
pub trait Method: Send + Sync {
    fn access(&self) -> Access;

    async fn execute(&self, ctx: &CallContext, args: Value) -> Result<Value>;
}

/// Everything a method invocation may touch.
#[derive(Clone)]
pub struct CallContext {
    pub method: String,
    pub session: Option<Arc<Session>>,
    pub transport: Arc<TransportIdentity>,
    pub sandbox: Arc<Sandbox>,
}

impl CallContext {
    pub fn capabilities(&self) -> &Arc<Capabilities> {
        self.sandbox.capabilities()
    }

    /// Pushes an event to the caller. Only persistent connections carry events.
    pub async fn emit(&self, event: EventEnvelope) -> Result<()> {
        match self.transport.responder() {
            Some(responder) => responder.emit(&event).await,
            None => Err(KeelError::Transport(
                "events require a persistent connection".into(),
            )),
        }
    }
}

/// A method bound to one call's context, ready to run under the sandbox's
/// execution timeout.
pub struct BoundCall {
    pub(crate) method: Arc<dyn Method>,
    pub(crate) ctx: CallContext,
    pub(crate) timeout: Duration,
}

impl BoundCall {
    pub async fn invoke(self, args: Value) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.method.execute(&self.ctx, args)).await {
            Ok(result) => result,
            Err(_) => Err(KeelError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Name → method map shared by the loader and every sandbox of a worker.
///
/// Entries are swapped whole under a short write lock. A caller that already
/// holds an `Arc<dyn Method>` keeps running the body it resolved.
#[derive(Clone, Default)]
pub struct MethodTable {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Method>>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `method` under `name`, returning the body it replaced.
    pub fn insert(&self, name: impl Into<String>, method: Arc<dyn Method>) -> Option<Arc<dyn Method>> {
        self.inner.write().insert(name.into(), method)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
