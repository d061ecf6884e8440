//! Execution sandboxes and the idle sandbox pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use keel_common::{KeelError, Result};
use parking_lot::Mutex;

use crate::capabilities::Capabilities;
use crate::identity::TransportIdentity;
use crate::method::{Access, BoundCall, CallContext, MethodTable};
use crate::resource_limits::ResourceLimits;
use crate::session::Session;

/// An execution context bound to one capability set and one method table.
///
/// A worker owns one default sandbox for anonymous calls; every live
/// session is bound to a sandbox of its own.
pub struct Sandbox {
    id: u64,
    capabilities: Arc<Capabilities>,
    methods: MethodTable,
    limits: ResourceLimits,
}

impl Sandbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Resolves `name` and binds it to the caller's context.
    pub fn run(
        self: &Arc<Self>,
        name: &str,
        session: Option<Arc<Session>>,
        transport: Arc<TransportIdentity>,
    ) -> Result<(Access, BoundCall)> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| KeelError::NotFound(name.to_string()))?;
        let access = method.access();
        let ctx = CallContext {
            method: name.to_string(),
            session,
            transport,
            sandbox: self.clone(),
        };
        Ok((
            access,
            BoundCall {
                method,
                ctx,
                timeout: self.limits.execution_timeout,
            },
        ))
    }
}

/// Pre-built idle sandboxes for new sessions.
///
/// [`SandboxPool::take`] never waits for construction beyond building one
/// sandbox on demand when the pool is empty; refilling runs as a background
/// task, at most one at a time.
pub struct SandboxPool {
    capabilities: Arc<Capabilities>,
    methods: MethodTable,
    limits: ResourceLimits,
    size: usize,
    next_id: AtomicU64,
    taken: AtomicU64,
    idle: Mutex<Vec<Arc<Sandbox>>>,
    refilling: AtomicBool,
}

impl SandboxPool {
    pub fn new(
        capabilities: Arc<Capabilities>,
        methods: MethodTable,
        limits: ResourceLimits,
        size: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            capabilities,
            methods,
            limits,
            size,
            next_id: AtomicU64::new(0),
            taken: AtomicU64::new(0),
            idle: Mutex::new(Vec::with_capacity(size)),
            refilling: AtomicBool::new(false),
        });
        pool.fill();
        pool
    }

    /// Builds a sandbox outside the pool.
    pub fn build(&self) -> Arc<Sandbox> {
        Arc::new(Sandbox {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            capabilities: self.capabilities.clone(),
            methods: self.methods.clone(),
            limits: self.limits.clone(),
        })
    }

    /// Takes an idle sandbox, or builds one when none is idle.
    pub fn take(self: &Arc<Self>) -> Arc<Sandbox> {
        self.taken.fetch_add(1, Ordering::Relaxed);
        let sandbox = self.idle.lock().pop();
        self.schedule_refill();
        match sandbox {
            Some(sandbox) => sandbox,
            None => {
                tracing::debug!("Sandbox pool empty, building on demand");
                self.build()
            }
        }
    }

    /// Sandboxes handed out by [`SandboxPool::take`] so far.
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn fill(&self) {
        loop {
            let missing = self.size.saturating_sub(self.idle.lock().len());
            if missing == 0 {
                return;
            }
            let sandbox = self.build();
            self.idle.lock().push(sandbox);
        }
    }

    fn schedule_refill(self: &Arc<Self>) {
        if self.refilling.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            pool.fill();
            pool.refilling.store(false, Ordering::Release);
        });
    }
}
