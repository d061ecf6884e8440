//! Worker application
//!
//! Wires one worker process together: capabilities, shared modules, method
//! table and loader, sandbox pool, sessions, admission semaphore, channel,
//! and the transports for the worker's role. Background workers run the
//! shared modules' start hooks. Stopped by a `{"name":"stop"}` control
//! message on stdin (or stdin closing).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_common::{AdmissionSemaphore, KeelError, Result, ServerConfig};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capabilities::Capabilities;
use crate::channel::Channel;
use crate::http_server::HttpServer;
use crate::loader::{LoaderWatch, ModuleLoader};
use crate::method::MethodTable;
use crate::methods;
use crate::metrics::{MetricsCollector, WorkerRole};
use crate::modules::ModuleTable;
use crate::resource_limits::ResourceLimits;
use crate::sandbox::SandboxPool;
use crate::script;
use crate::security::{Argon2Hasher, Hashing};
use crate::socket_server::SocketServer;
use crate::static_files::StaticFiles;
use crate::storage::{MemoryStorage, SqliteStorage, Storage};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Message the supervisor sends on a worker's stdin.
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    pub name: String,
}

/// Addresses a started worker listens on.
#[derive(Debug, Clone, Copy)]
pub struct Bound {
    pub http: SocketAddr,
    pub socket: SocketAddr,
}

pub struct Application {
    config: ServerConfig,
    role: WorkerRole,
    capabilities: Arc<Capabilities>,
    limits: ResourceLimits,
    methods: MethodTable,
    loader: Arc<ModuleLoader>,
    channel: Arc<Channel>,
    watch: Mutex<Option<LoaderWatch>>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
    shutdown: watch::Sender<bool>,
    finalizing: AtomicBool,
}

impl Application {
    /// Builds a worker with Argon2 password hashing.
    pub async fn build(config: ServerConfig, role: WorkerRole, slot: usize) -> Result<Arc<Self>> {
        let hashing = tokio::task::spawn_blocking(Argon2Hasher::new)
            .await
            .map_err(|e| KeelError::Internal(format!("Hasher setup failed: {}", e)))??;
        Self::with_hashing(config, role, slot, Arc::new(hashing)).await
    }

    pub async fn with_hashing(
        config: ServerConfig,
        role: WorkerRole,
        slot: usize,
        hashing: Arc<dyn Hashing>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let limits = ResourceLimits::from_config(&config);
        limits.validate().map_err(KeelError::Internal)?;

        let storage: Arc<dyn Storage> = match &config.data {
            Some(dir) => Arc::new(SqliteStorage::open(dir).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        let modules = ModuleTable::new(&config.modules);
        let capabilities = Capabilities::with_modules(storage, hashing, modules.clone());

        let methods = MethodTable::new();
        let loader = Arc::new(
            ModuleLoader::new(&config.methods, methods.clone(), limits.clone()).with_modules(modules),
        );
        loader.reserve(methods::NATIVE_METHODS);
        loader.load().await?;

        let pool = SandboxPool::new(
            capabilities.clone(),
            methods.clone(),
            limits.clone(),
            config.sandbox_pool,
        );
        let sessions = Arc::new(crate::session::SessionStore::new(&capabilities, pool.clone()));
        let metrics = Arc::new(MetricsCollector::new(role, slot));
        methods::register(&methods, sessions.clone(), metrics.clone());

        let semaphore =
            AdmissionSemaphore::new(config.concurrency, config.queue.size, config.queue_timeout());
        let channel = Arc::new(Channel::new(pool.build(), sessions, semaphore, metrics));

        let (shutdown, _) = watch::channel(false);
        tracing::info!(role = %role, slot, methods = methods.len(), "Worker built");

        Ok(Arc::new(Self {
            config,
            role,
            capabilities,
            limits,
            methods,
            loader,
            channel,
            watch: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            finalizing: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn modules(&self) -> &ModuleTable {
        self.capabilities.modules()
    }

    /// Runs every start hook once, in name order. A failing hook is logged
    /// and does not stop the others. Returns how many succeeded.
    pub async fn run_start_hooks(&self) -> usize {
        let mut succeeded = 0;
        for hook in self.modules().start_hooks() {
            match script::run_start_hook(&hook, self.capabilities.clone(), &self.limits).await {
                Ok(_) => {
                    tracing::info!(hook = %hook.name(), "Start hook finished");
                    succeeded += 1;
                }
                Err(e) => tracing::error!(hook = %hook.name(), "Start hook failed: {}", e),
            }
        }
        succeeded
    }

    /// Starts watching the methods and modules directories.
    pub fn watch_methods(&self) -> Result<()> {
        let watch = self.loader.watch()?;
        *self.watch.lock() = Some(watch);
        Ok(())
    }

    /// Binds the HTTP transport on `port` and the persistent transport on
    /// `port + socket_offset`, then serves both in the background. Port `0`
    /// binds both on ephemeral ports.
    pub async fn serve(&self, port: u16) -> Result<Bound> {
        let host = self.config.host.as_str();
        let socket_port = if port == 0 { 0 } else { self.config.socket_port(port) };
        let http_addr = resolve(host, port).await?;
        let socket_addr = resolve(host, socket_port).await?;

        let http_listener = HttpServer::bind(http_addr).await?;
        let socket_listener = SocketServer::bind(socket_addr).await?;
        let bound = Bound {
            http: local_addr(&http_listener)?,
            socket: local_addr(&socket_listener)?,
        };

        let static_files = StaticFiles::load(&self.config.static_dir).await?;
        let http = HttpServer::new(self.channel.clone(), static_files, self.config.redirect.clone());
        let socket = SocketServer::new(self.channel.clone(), self.config.connection_timeout());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(http.run(http_listener, self.shutdown.subscribe())));
        tasks.push(tokio::spawn(socket.run(socket_listener, self.shutdown.subscribe())));

        tracing::info!(http = %bound.http, socket = %bound.socket, "Worker serving");
        Ok(bound)
    }

    /// Reads control messages until a stop arrives or the input closes,
    /// then stops the worker.
    pub async fn control<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(message) if message.name == "stop" => break,
                    Ok(message) => tracing::warn!("Unknown control message: {}", message.name),
                    Err(e) => tracing::warn!("Malformed control message: {}", e),
                },
                None => {
                    tracing::info!("Control input closed");
                    break;
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stops accepting work, waits for in-flight calls up to the stop
    /// timeout and closes storage. Returns `false` when a stop was already
    /// under way.
    pub async fn stop(&self) -> bool {
        if self.finalizing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Stop already in progress");
            return false;
        }
        tracing::info!(role = %self.role, "Worker stopping");

        let _ = self.shutdown.send(true);
        self.watch.lock().take();

        let deadline = Instant::now() + self.config.stop_timeout();
        let semaphore = self.channel.semaphore();
        while semaphore.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if semaphore.in_flight() > 0 {
            tracing::warn!(in_flight = semaphore.in_flight(), "Stopping with calls still running");
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match task.await {
                Ok(Err(e)) => tracing::warn!("Transport ended with error: {}", e),
                Err(e) => tracing::warn!("Transport task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        if let Err(e) = self.capabilities.storage().close().await {
            tracing::warn!("Failed to close storage: {}", e);
        }
        tracing::info!(role = %self.role, "Worker stopped");
        true
    }

    pub fn is_stopping(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| KeelError::Internal(format!("Invalid host {}: {}", host, e)))?
        .next()
        .ok_or_else(|| KeelError::Internal(format!("Host {} did not resolve", host)))
}

fn local_addr(listener: &tokio::net::TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| KeelError::Transport(format!("Failed to get local address: {}", e)))
}
