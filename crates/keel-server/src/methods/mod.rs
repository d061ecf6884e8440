//! Built-in native methods.
//!
//! Registered in the same table as script methods and reached through the
//! same [`Method`](crate::method::Method) contract.

mod auth;
mod system;

use std::sync::Arc;

use crate::method::MethodTable;
use crate::metrics::MetricsCollector;
use crate::session::SessionStore;

pub use auth::{RegisterUser, SignIn, SignOut, Status};
pub use system::{Info, Metrics};

/// Message for any failed sign-in, whichever part was wrong.
pub const SIGN_IN_FAILED: &str = "Incorrect login or password";

/// Names of the built-ins, in registration order.
pub const NATIVE_METHODS: [&str; 6] = ["signIn", "signOut", "registerUser", "status", "_metrics", "_info"];

/// Installs every built-in into `table`.
pub fn register(table: &MethodTable, sessions: Arc<SessionStore>, metrics: Arc<MetricsCollector>) {
    table.insert("signIn", Arc::new(SignIn::new(sessions.clone())));
    table.insert("signOut", Arc::new(SignOut::new(sessions.clone())));
    table.insert("registerUser", Arc::new(RegisterUser::new(sessions)));
    table.insert("status", Arc::new(Status));
    table.insert("_metrics", Arc::new(Metrics::new(metrics.clone())));
    table.insert("_info", Arc::new(Info::new(metrics)));
}
