//! Keel worker
//!
//! This crate runs one Keel worker process: it loads methods from a
//! directory, executes them in capability-restricted sandboxes and serves
//! them over HTTP and persistent framed TCP.

pub mod application;
pub mod capabilities;
pub mod channel;
pub mod http_server;
pub mod identity;
pub mod loader;
pub mod method;
pub mod methods;
pub mod metrics;
pub mod modules;
pub mod resource_limits;
pub mod sandbox;
pub mod script;
pub mod security;
pub mod session;
pub mod socket_server;
pub mod static_files;
pub mod storage;

pub use application::{Application, Bound};
pub use capabilities::Capabilities;
pub use channel::Channel;
pub use loader::ModuleLoader;
pub use method::{Access, CallContext, Method, MethodTable};
pub use metrics::{MetricsCollector, WorkerRole};
pub use modules::{ModuleTable, SharedModule};
pub use resource_limits::ResourceLimits;
pub use sandbox::{Sandbox, SandboxPool};
pub use script::ScriptMethod;
pub use security::{Argon2Hasher, Hashing};
pub use session::{Session, SessionStore};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
