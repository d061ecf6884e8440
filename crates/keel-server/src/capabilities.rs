//! Capability registry
//!
//! The fixed set of host services a method may use, plus the shared module
//! namespaces injected as `lib`. Built once per worker and shared as
//! `Arc<Capabilities>`; there are no mutators.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::modules::ModuleTable;
use crate::security::Hashing;
use crate::storage::Storage;

/// Names under which script methods see the capabilities.
pub const CAPABILITY_NAMES: [&str; 5] = ["storage", "security", "clock", "log", "lib"];

pub struct Capabilities {
    storage: Arc<dyn Storage>,
    hashing: Arc<dyn Hashing>,
    modules: ModuleTable,
}

impl Capabilities {
    /// Capabilities with no shared modules.
    pub fn new(storage: Arc<dyn Storage>, hashing: Arc<dyn Hashing>) -> Arc<Self> {
        Self::with_modules(storage, hashing, ModuleTable::default())
    }

    pub fn with_modules(
        storage: Arc<dyn Storage>,
        hashing: Arc<dyn Hashing>,
        modules: ModuleTable,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            hashing,
            modules,
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn hashing(&self) -> &Arc<dyn Hashing> {
        &self.hashing
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// Milliseconds since the Unix epoch.
    pub fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
