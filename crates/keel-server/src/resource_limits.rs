//! Resource limits for method execution.

use std::time::Duration;

use keel_common::ServerConfig;

/// Loop iterations granted per millisecond of execution timeout. Caps the
/// configured loop limit so a body abandoned by the timeout stops in a time
/// proportional to that timeout.
pub const LOOP_ITERATIONS_PER_MS: u64 = 2_000;

/// Bounds applied to every method invocation.
///
/// - `execution_timeout` - wall-clock bound per call (default: 5 seconds)
/// - `loop_iteration_limit` - script engines stop a body after this many loop
///   iterations, so a body abandoned by the timeout still terminates
///
/// # Example
///
/// ```
/// use keel_server::ResourceLimits;
/// use std::time::Duration;
///
/// let limits = ResourceLimits::new()
///     .with_execution_timeout(Duration::from_secs(2));
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub execution_timeout: Duration,
    pub loop_iteration_limit: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(5),
            loop_iteration_limit: 100_000_000,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            execution_timeout: config.execution_timeout(),
            loop_iteration_limit: config.loop_iteration_limit,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    /// The loop limit an engine context is created with: the configured
    /// limit, capped at [`LOOP_ITERATIONS_PER_MS`] per millisecond of timeout.
    pub fn effective_loop_limit(&self) -> u64 {
        let budget = (self.execution_timeout.as_millis() as u64).saturating_mul(LOOP_ITERATIONS_PER_MS);
        self.loop_iteration_limit.min(budget.max(1))
    }

    /// Rejects a zero or longer-than-an-hour timeout and a zero loop limit.
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_timeout.is_zero() {
            return Err("execution timeout must be greater than zero".to_string());
        }

        if self.execution_timeout.as_secs() > 3600 {
            return Err(format!(
                "execution timeout must be <= 1 hour (got {} seconds)",
                self.execution_timeout.as_secs()
            ));
        }

        if self.loop_iteration_limit == 0 {
            return Err("loop iteration limit must be greater than zero".to_string());
        }

        Ok(())
    }
}
