//! Worker process supervision
//!
//! Each slot runs as a child process with piped stdin. A child that exits
//! abnormally while the supervisor is running is respawned after a backoff;
//! a clean exit is final. On shutdown every child receives
//! `{"name":"stop"}` on stdin and is killed if it has not exited within the
//! stop timeout plus [`KILL_GRACE`]. The worker bounds its own drain by the
//! stop timeout, so the grace covers closing transports and storage.
//!
//! On unix each child leads its own process group, so a terminal Ctrl-C
//! reaches only the supervisor, which then stops the workers in order.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_common::{KeelError, Result, ServerConfig};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::plan::{plan, Slot};

/// Environment variable carrying the worker configuration as JSON.
pub const WORKER_CONFIG_ENV: &str = "KEEL_WORKER_CONFIG";

const STOP_MESSAGE: &[u8] = b"{\"name\":\"stop\"}\n";
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// A worker that ran at least this long restarts without accumulated backoff.
const STABLE_AFTER: Duration = Duration::from_secs(10);
/// Time past the stop timeout a stopping worker gets before it is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Launches the running executable itself.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the slot arguments.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, slot: &Slot, config_json: &str) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(slot.worker_args())
            .env(WORKER_CONFIG_ENV, config_json)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command.spawn().map_err(|e| {
            KeelError::Internal(format!(
                "Failed to start {} for slot {}: {}",
                self.program.display(),
                slot.index,
                e
            ))
        })
    }
}

pub struct Supervisor {
    config: ServerConfig,
    launcher: Launcher,
    slots: Vec<Slot>,
}

impl Supervisor {
    /// Supervisor for the slots `config` plans.
    pub fn new(config: ServerConfig, launcher: Launcher) -> Self {
        let slots = plan(&config);
        Self {
            config,
            launcher,
            slots,
        }
    }

    /// Supervisor for an explicit slot list.
    pub fn with_slots(config: ServerConfig, launcher: Launcher, slots: Vec<Slot>) -> Self {
        Self {
            config,
            launcher,
            slots,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Runs every slot until `shutdown` resolves, then stops them all.
    /// Also returns once every slot has exited cleanly on its own.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let config_json = Arc::new(serde_json::to_string(&self.config)?);
        let launcher = Arc::new(self.launcher);
        let stop_timeout = self.config.stop_timeout();
        let (stop, stopping) = watch::channel(false);

        tracing::info!(slots = self.slots.len(), "Supervisor starting");
        let tasks: Vec<_> = self
            .slots
            .into_iter()
            .map(|slot| {
                tokio::spawn(supervise(
                    slot,
                    launcher.clone(),
                    config_json.clone(),
                    stopping.clone(),
                    stop_timeout,
                ))
            })
            .collect();

        let all = futures::future::join_all(tasks);
        tokio::pin!(all);
        tokio::pin!(shutdown);

        let results = tokio::select! {
            results = &mut all => results,
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping workers");
                let _ = stop.send(true);
                all.await
            }
        };

        for result in results {
            if let Err(e) = result {
                tracing::error!("Slot task failed: {}", e);
            }
        }
        tracing::info!("Supervisor stopped");
        Ok(())
    }
}

/// Keeps one slot running until it exits cleanly or a stop is requested.
async fn supervise(
    slot: Slot,
    launcher: Arc<Launcher>,
    config_json: Arc<String>,
    mut stopping: watch::Receiver<bool>,
    stop_timeout: Duration,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *stopping.borrow() {
            return;
        }

        let started = Instant::now();
        let mut child = match launcher.spawn(&slot, &config_json) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("{}", e);
                if wait_or_stop(&mut stopping, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        tracing::info!(slot = slot.index, role = %slot.role, pid = child.id(), "Worker started");

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        tracing::info!(slot = slot.index, "Worker exited cleanly");
                        return;
                    }
                    Ok(status) => {
                        tracing::warn!(slot = slot.index, "Worker exited abnormally: {}", describe(status));
                    }
                    Err(e) => tracing::warn!(slot = slot.index, "Failed to wait for worker: {}", e),
                }
            }
            _ = stopping.changed() => {
                stop_child(&slot, &mut child, stop_timeout).await;
                return;
            }
        }

        if started.elapsed() >= STABLE_AFTER {
            backoff = INITIAL_BACKOFF;
        }
        if wait_or_stop(&mut stopping, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
        tracing::info!(slot = slot.index, "Restarting worker");
    }
}

/// Sleeps for `delay`; returns `true` if a stop arrived first.
async fn wait_or_stop(stopping: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *stopping.borrow(),
        _ = stopping.changed() => true,
    }
}

async fn stop_child(slot: &Slot, child: &mut Child, stop_timeout: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(STOP_MESSAGE).await {
            tracing::debug!(slot = slot.index, "Failed to send stop: {}", e);
        }
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(stop_timeout + KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(slot = slot.index, "Worker stopped: {}", describe(status));
        }
        Ok(Err(e)) => tracing::warn!(slot = slot.index, "Failed to wait for worker: {}", e),
        Err(_) => {
            tracing::warn!(slot = slot.index, "Worker did not stop in time, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(slot = slot.index, "Failed to kill worker: {}", e);
            }
        }
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
