// Copyright 2025 Keel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker process entry points.

use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use keel_common::{ServerConfig, WorkerRole};
use keel_server::application::ControlMessage;
use keel_server::Application;
use keel_supervisor::{Balancer, WORKER_CONFIG_ENV};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;

/// Reads the configuration the supervisor hands to its workers.
pub fn config_from_env() -> Result<ServerConfig> {
    let raw = std::env::var(WORKER_CONFIG_ENV)
        .with_context(|| format!("{} is not set; workers are started by `keel serve`", WORKER_CONFIG_ENV))?;
    parse_config(&raw)
}

pub(crate) fn parse_config(raw: &str) -> Result<ServerConfig> {
    let config: ServerConfig =
        serde_json::from_str(raw).context("Invalid worker configuration")?;
    config.validate()?;
    Ok(config)
}

/// Runs a server or background worker until `input` delivers a stop
/// message or closes. Server workers serve and watch their directories;
/// background workers run the shared modules' start hooks.
pub async fn run_worker<R>(
    config: ServerConfig,
    role: WorkerRole,
    slot: usize,
    port: Option<u16>,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let app = Application::build(config, role, slot).await?;
    tracing::info!(slot, role = %role, methods = app.methods().len(), "Worker ready");

    match role {
        WorkerRole::Server => {
            let port = port.ok_or_else(|| anyhow!("server workers need --port"))?;
            app.serve(port).await?;
            app.watch_methods()?;
        }
        WorkerRole::Background => {
            let hooks = app.modules().start_hooks().len();
            let succeeded = app.run_start_hooks().await;
            tracing::info!(slot, hooks, succeeded, "Start hooks finished");
        }
        WorkerRole::Balancer => {}
    }

    app.control(input).await?;
    Ok(())
}

/// Runs the balancer on the configured balancer port until `input` delivers
/// a stop message or closes.
pub async fn run_balancer<R>(config: ServerConfig, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let port = config
        .balancer
        .ok_or_else(|| anyhow!("no balancer port configured"))?;
    let addr = resolve(&config.host, port).await?;
    let listener = Balancer::bind(addr).await?;

    let (stop, stopping) = watch::channel(false);
    let task = tokio::spawn(Balancer::new(config.ports.clone()).run(listener, stopping));

    wait_for_stop(input).await?;
    let _ = stop.send(true);
    task.await.context("Balancer task failed")??;
    Ok(())
}

/// Returns once a `{"name":"stop"}` line arrives or the input closes.
pub async fn wait_for_stop<R>(input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlMessage>(&line) {
            Ok(message) if message.name == "stop" => return Ok(()),
            Ok(message) => tracing::warn!("Unknown control message: {}", message.name),
            Err(e) => tracing::warn!("Malformed control message: {}", e),
        }
    }
    tracing::info!("Control input closed");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Invalid host {}", host))?
        .next()
        .ok_or_else(|| anyhow!("Host {} did not resolve", host))
}
