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

//! # Keel CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the supervisor with the default layout (two servers and a balancer)
//! keel serve
//!
//! # Read a configuration file and override the ports
//! keel serve --config keel.json --ports 8001 --ports 8002 --balancer 8000
//!
//! # Make a call and pipe the result to jq
//! keel call http://127.0.0.1:3331 status --token 3f2a... | jq .userId
//! ```
//!
//! `keel worker` is started by the supervisor and is not meant to be run by
//! hand.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use keel_common::{ServerConfig, WorkerRole};
use keel_supervisor::{Launcher, Supervisor};
use tokio::io::BufReader;

#[derive(FromArgs)]
/// Keel application server
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Worker(WorkerArgs),
    Call(CallArgs),
}

/// Arguments for running the supervisor.
///
/// Flags override the values read from `--config`; anything neither sets
/// keeps its default.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the supervisor and its workers
struct ServeArgs {
    /// path to a JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// interface the workers bind to
    #[argh(option)]
    host: Option<String>,

    /// HTTP port of a server worker; repeat for more workers
    ///
    /// The persistent socket of each worker listens on this port plus the
    /// configured socket offset.
    #[argh(option, short = 'p', long = "ports")]
    ports: Vec<u16>,

    /// port of the balancer
    #[argh(option)]
    balancer: Option<u16>,

    /// run without a balancer
    #[argh(switch, long = "no-balancer")]
    no_balancer: bool,

    /// directory of method files
    #[argh(option)]
    methods: Option<PathBuf>,

    /// directory of shared modules
    #[argh(option)]
    modules: Option<PathBuf>,

    /// directory of static files
    #[argh(option, long = "static")]
    static_dir: Option<PathBuf>,

    /// shared storage directory; sessions survive across workers only
    /// when it is set
    #[argh(option)]
    data: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// run one worker slot (started by `keel serve`)
struct WorkerArgs {
    /// index of the slot
    #[argh(option)]
    slot: usize,

    /// role of the slot: server, balancer or background
    #[argh(option)]
    role: WorkerRole,

    /// HTTP port for server workers
    #[argh(option)]
    port: Option<u16>,
}

/// Arguments for making a single RPC call.
///
/// Outputs the raw JSON result to stdout. Errors are reported on stderr
/// with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a server worker
struct CallArgs {
    /// base URL of a server worker, e.g. http://127.0.0.1:3331
    #[argh(positional)]
    server_address: String,

    /// name of the method, e.g. `signIn` or `example/resources`
    #[argh(positional)]
    method: String,

    /// JSON arguments for the method; defaults to `{}`
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// session token to send as the session cookie
    #[argh(option, short = 't')]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Worker(args) => {
            let config = keel_cli::config_from_env()?;
            let input = BufReader::new(tokio::io::stdin());
            match args.role {
                WorkerRole::Balancer => keel_cli::run_balancer(config, input).await,
                role => keel_cli::run_worker(config, role, args.slot, args.port, input).await,
            }
        }
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = serve_config(args)?;
    tracing::info!(
        host = %config.host,
        ports = ?config.ports,
        balancer = ?config.balancer,
        background = config.workers.pool,
        "Starting Keel"
    );

    let supervisor = Supervisor::new(config, Launcher::current_exe()?);
    supervisor.run(keel_cli::shutdown_signal()).await?;
    tracing::info!("Keel stopped");
    Ok(())
}

fn serve_config(args: ServeArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if !args.ports.is_empty() {
        config.ports = args.ports;
    }
    if args.no_balancer {
        config.balancer = None;
    } else if let Some(port) = args.balancer {
        config.balancer = Some(port);
    }
    if let Some(methods) = args.methods {
        config.methods = methods;
    }
    if let Some(modules) = args.modules {
        config.modules = modules;
    }
    if let Some(static_dir) = args.static_dir {
        config.static_dir = static_dir;
    }
    if let Some(data) = args.data {
        config.data = Some(data);
    }
    config.validate()?;
    Ok(config)
}

async fn run_call(args: CallArgs) -> Result<()> {
    validate_http_url(&args.server_address)?;

    let args_value: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let mut client = keel_client::HttpClient::new(&args.server_address)?;
    if let Some(token) = args.token {
        client = client.with_token(token);
    }
    let result = client.call(args.method, args_value).await?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn validate_http_url(url: &str) -> Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!(
            "Invalid server address '{}': must start with http:// or https://",
            url
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["keel"], args).unwrap()
    }

    #[test]
    fn test_serve_overrides() {
        let Commands::Serve(args) = parse(&[
            "serve", "--ports", "8001", "--ports", "8002", "--balancer", "8000", "--data", "/tmp/keel",
            "--modules", "app/lib",
        ])
        .command
        else {
            panic!("expected serve");
        };
        let config = serve_config(args).unwrap();
        assert_eq!(config.ports, vec![8001, 8002]);
        assert_eq!(config.balancer, Some(8000));
        assert_eq!(config.data, Some(PathBuf::from("/tmp/keel")));
        assert_eq!(config.modules, PathBuf::from("app/lib"));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_serve_without_balancer() {
        let Commands::Serve(args) = parse(&["serve", "--no-balancer"]).command else {
            panic!("expected serve");
        };
        let config = serve_config(args).unwrap();
        assert_eq!(config.balancer, None);
        assert_eq!(config.ports, ServerConfig::default().ports);
    }

    #[test]
    fn test_serve_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.json");
        std::fs::write(&path, r#"{"ports": [9001], "host": "0.0.0.0"}"#).unwrap();

        let Commands::Serve(args) =
            parse(&["serve", "-c", path.to_str().unwrap(), "--host", "127.0.0.2"]).command
        else {
            panic!("expected serve");
        };
        let config = serve_config(args).unwrap();
        assert_eq!(config.ports, vec![9001]);
        assert_eq!(config.host, "127.0.0.2");
    }

    #[test]
    fn test_worker_args() {
        let Commands::Worker(args) =
            parse(&["worker", "--slot", "2", "--role", "server", "--port", "3332"]).command
        else {
            panic!("expected worker");
        };
        assert_eq!(args.slot, 2);
        assert_eq!(args.role, WorkerRole::Server);
        assert_eq!(args.port, Some(3332));

        assert!(Cli::from_args(&["keel"], &["worker", "--slot", "0", "--role", "nope"]).is_err());
    }

    #[test]
    fn test_call_defaults() {
        let Commands::Call(args) = parse(&["call", "http://127.0.0.1:3331", "status"]).command else {
            panic!("expected call");
        };
        assert_eq!(args.method, "status");
        assert_eq!(args.args, "{}");
        assert_eq!(args.token, None);
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:3331").is_ok());
        assert!(validate_http_url("https://example.com").is_ok());
        assert!(validate_http_url("127.0.0.1:3331").is_err());
    }
}
