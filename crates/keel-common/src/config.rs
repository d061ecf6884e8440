//! Server configuration
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid. Command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::error::{KeelError, Result};

/// What a worker process does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Server,
    Balancer,
    Background,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Server => "server",
            WorkerRole::Balancer => "balancer",
            WorkerRole::Background => "background",
        }
    }
}

impl std::str::FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "server" => Ok(WorkerRole::Server),
            "balancer" => Ok(WorkerRole::Balancer),
            "background" => Ok(WorkerRole::Background),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum number of callers waiting for a permit
    pub size: usize,
    /// Maximum wait for a permit, in milliseconds
    pub timeout: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size: 2000,
            timeout: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkersConfig {
    /// Number of background worker slots
    pub pool: usize,
    /// Grace period for a worker to stop, in milliseconds
    pub timeout: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            pool: 2,
            timeout: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    /// One server slot per port
    pub ports: Vec<u16>,
    /// Balancer port; no balancer slot when absent
    pub balancer: Option<u16>,
    /// Persistent socket port = HTTP port + offset
    pub socket_offset: u16,
    /// Method execution timeout, in milliseconds
    pub timeout: u64,
    /// Persistent connection inactivity timeout, in milliseconds
    pub connection_timeout: u64,
    /// Concurrent executions admitted per worker
    pub concurrency: usize,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    /// Idle sandboxes kept ready for new sessions
    pub sandbox_pool: usize,
    /// Loop iteration limit for script method bodies
    pub loop_iteration_limit: u64,
    /// Upgrade redirect target for the first `GET /` per host, e.g. `https://example.com`
    pub redirect: Option<String>,
    pub methods: PathBuf,
    /// Shared modules injected into every script as `lib`
    pub modules: PathBuf,
    #[serde(rename = "static")]
    pub static_dir: PathBuf,
    /// Shared storage directory. Sessions only survive across worker
    /// processes when this is set.
    pub data: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![3331, 3332],
            balancer: Some(3330),
            socket_offset: 1000,
            timeout: 5000,
            connection_timeout: 30_000,
            concurrency: 1000,
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            sandbox_pool: 20,
            loop_iteration_limit: 100_000_000,
            redirect: None,
            methods: PathBuf::from("application/methods"),
            modules: PathBuf::from("application/lib"),
            static_dir: PathBuf::from("application/static"),
            data: None,
        }
    }
}

impl ServerConfig {
    /// Reads a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Internal(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(KeelError::Internal("concurrency must be greater than 0".into()));
        }
        if self.timeout == 0 {
            return Err(KeelError::Internal("timeout must be greater than 0".into()));
        }
        for port in &self.ports {
            if port.checked_add(self.socket_offset).is_none() {
                return Err(KeelError::Internal(format!(
                    "socket port for {} overflows with offset {}",
                    port, self.socket_offset
                )));
            }
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.timeout)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.timeout)
    }

    pub fn socket_port(&self, http_port: u16) -> u16 {
        http_port.saturating_add(self.socket_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.ports, vec![3331, 3332]);
        assert_eq!(config.balancer, Some(3330));
        assert_eq!(config.timeout, 5000);
        assert_eq!(config.concurrency, 1000);
        assert_eq!(config.queue, QueueConfig { size: 2000, timeout: 3000 });
        assert_eq!(config.workers, WorkersConfig { pool: 2, timeout: 3000 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ports": [8001], "queue": {{"timeout": 100}}, "static": "public", "socketOffset": 10}}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ports, vec![8001]);
        assert_eq!(config.queue.timeout, 100);
        assert_eq!(config.queue.size, 2000);
        assert_eq!(config.static_dir, PathBuf::from("public"));
        assert_eq!(config.socket_port(8001), 8011);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("server".parse::<WorkerRole>().unwrap(), WorkerRole::Server);
        assert_eq!("balancer".parse::<WorkerRole>().unwrap(), WorkerRole::Balancer);
        assert!("other".parse::<WorkerRole>().is_err());
        assert_eq!(WorkerRole::Background.to_string(), "background");
    }

    #[test]
    fn test_validation() {
        let config = ServerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            ports: vec![u16::MAX],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
