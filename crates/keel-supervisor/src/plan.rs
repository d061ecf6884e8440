//! Role plan: which worker processes a configuration asks for.

use keel_common::{ServerConfig, WorkerRole};

/// One supervised process position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub role: WorkerRole,
    /// HTTP port for server and balancer slots
    pub port: Option<u16>,
}

impl Slot {
    /// Arguments for `keel worker` describing this slot.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--slot".to_string(),
            self.index.to_string(),
            "--role".to_string(),
            self.role.to_string(),
        ];
        if let Some(port) = self.port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        args
    }
}

/// Servers first (one per port), then the balancer, then background slots.
pub fn plan(config: &ServerConfig) -> Vec<Slot> {
    let mut slots = Vec::new();
    for port in &config.ports {
        slots.push(Slot {
            index: slots.len(),
            role: WorkerRole::Server,
            port: Some(*port),
        });
    }
    if let Some(port) = config.balancer {
        slots.push(Slot {
            index: slots.len(),
            role: WorkerRole::Balancer,
            port: Some(port),
        });
    }
    for _ in 0..config.workers.pool {
        slots.push(Slot {
            index: slots.len(),
            role: WorkerRole::Background,
            port: None,
        });
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan() {
        let slots = plan(&ServerConfig::default());
        let roles: Vec<_> = slots.iter().map(|s| (s.index, s.role, s.port)).collect();
        assert_eq!(
            roles,
            vec![
                (0, WorkerRole::Server, Some(3331)),
                (1, WorkerRole::Server, Some(3332)),
                (2, WorkerRole::Balancer, Some(3330)),
                (3, WorkerRole::Background, None),
                (4, WorkerRole::Background, None),
            ]
        );
    }

    #[test]
    fn test_plan_without_balancer() {
        let config = ServerConfig {
            ports: vec![8000],
            balancer: None,
            workers: keel_common::config::WorkersConfig { pool: 0, timeout: 100 },
            ..ServerConfig::default()
        };
        assert_eq!(
            plan(&config),
            vec![Slot {
                index: 0,
                role: WorkerRole::Server,
                port: Some(8000)
            }]
        );
    }

    #[test]
    fn test_worker_args() {
        let slot = Slot {
            index: 2,
            role: WorkerRole::Balancer,
            port: Some(3330),
        };
        assert_eq!(
            slot.worker_args(),
            vec!["worker", "--slot", "2", "--role", "balancer", "--port", "3330"]
        );
    }
}
