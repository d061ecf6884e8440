//! Keel supervisor
//!
//! Runs one OS process per role slot, restarts workers that crash and
//! relays shutdown to them. Also hosts the balancer role, which spreads
//! browsers across the server ports with redirects.

pub mod balancer;
pub mod plan;
pub mod supervisor;

pub use balancer::{Balancer, RoundRobin};
pub use plan::{plan, Slot};
pub use supervisor::{Launcher, Supervisor, KILL_GRACE, WORKER_CONFIG_ENV};
