//! Balancer role: answers every HTTP request with a redirect to the next
//! server port.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use keel_common::transport::cookie::host_without_port;
use keel_common::transport::{HttpTransport, HyperRequest, HyperResponse};
use keel_common::{KeelError, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Round-robin rotation over server ports.
pub struct RoundRobin {
    ports: Mutex<VecDeque<u16>>,
}

impl RoundRobin {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            ports: Mutex::new(VecDeque::from(ports)),
        }
    }

    /// Next port: moves the front to the back and returns it.
    pub fn next_port(&self) -> Option<u16> {
        let mut ports = self.ports.lock();
        let port = ports.pop_front()?;
        ports.push_back(port);
        Some(port)
    }

    pub fn len(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }
}

pub struct Balancer {
    targets: RoundRobin,
}

impl Balancer {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            targets: RoundRobin::new(ports),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| KeelError::Transport(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Serves redirects until `shutdown` turns `true`.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| KeelError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("Balancer listening on {}", local);

        let balancer = Arc::new(self);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let balancer = balancer.clone();
                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let balancer = balancer.clone();
                            async move { Ok::<_, std::convert::Infallible>(balancer.redirect(&req)) }
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!("Error serving connection: {}", err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn redirect(&self, req: &HyperRequest) -> HyperResponse {
        let Some(port) = self.targets.next_port() else {
            return HttpTransport::status(StatusCode::SERVICE_UNAVAILABLE);
        };
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(host_without_port)
            .unwrap_or("localhost");
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        HttpTransport::redirect(&location(host, port, path))
    }
}

fn location(host: &str, port: u16, path: &str) -> String {
    format!("http://{}:{}{}", host, port, path)
}
