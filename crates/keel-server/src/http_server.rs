//! HTTP transport
//!
//! - `POST /api` with a call envelope as the body
//! - `POST /api/<interface>/<method>` where the path names the target and the
//!   body is either a call envelope or the bare arguments (call id 1)
//! - `GET` anything else serves a static file
//!
//! Business and method errors travel inside a `200` response envelope;
//! non-2xx statuses are reserved for transport failures (malformed body,
//! wrong HTTP method, oversized body).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::header::{CONTENT_LENGTH, COOKIE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method as HttpMethod, StatusCode};
use hyper_util::rt::TokioIo;
use keel_common::transport::{HttpTransport, HyperRequest, HyperResponse, MAX_FRAME_SIZE};
use keel_common::{
    salvage_call_id, CallEnvelope, KeelError, Packet, ResponseEnvelope, Result,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::channel::Channel;
use crate::identity::TransportIdentity;
use crate::static_files::StaticFiles;

const API_PREFIX: &str = "/api";

pub struct HttpServer {
    channel: Arc<Channel>,
    static_files: StaticFiles,
    redirect: Option<String>,
    redirected_hosts: Mutex<HashSet<String>>,
}

impl HttpServer {
    pub fn new(channel: Arc<Channel>, static_files: StaticFiles, redirect: Option<String>) -> Self {
        Self {
            channel,
            static_files,
            redirect,
            redirected_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| KeelError::Transport(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Serves connections until `shutdown` turns `true`.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| KeelError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local);

        let server = Arc::new(self);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let server = server.clone();

                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = server.clone();
                            async move { Ok::<_, std::convert::Infallible>(server.handle(req, remote).await) }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::debug!("Error serving connection: {}", err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("HTTP server on {} stopped accepting", local);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&self, req: HyperRequest, remote: SocketAddr) -> HyperResponse {
        let path = req.uri().path().to_string();
        if path == API_PREFIX || path.starts_with("/api/") {
            return self.handle_api(req, remote, &path).await;
        }

        match *req.method() {
            HttpMethod::GET | HttpMethod::HEAD => self.handle_static(&req, &path),
            _ => HttpTransport::status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn handle_static(&self, req: &HyperRequest, path: &str) -> HyperResponse {
        if let Some(base) = &self.redirect {
            if path == "/" {
                let host = header(req, HOST).unwrap_or_default().to_string();
                if self.redirected_hosts.lock().insert(host) {
                    return HttpTransport::redirect(&format!("{}{}", base, path));
                }
            }
        }

        match self.static_files.get(path) {
            Some(asset) => HttpTransport::response(StatusCode::OK, asset.mime, asset.body.clone()),
            None => HttpTransport::status(StatusCode::NOT_FOUND),
        }
    }

    async fn handle_api(&self, req: HyperRequest, remote: SocketAddr, path: &str) -> HyperResponse {
        if req.method() != HttpMethod::POST {
            return HttpTransport::transport_error(StatusCode::METHOD_NOT_ALLOWED);
        }

        let declared = header(&req, CONTENT_LENGTH).and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > MAX_FRAME_SIZE) {
            return HttpTransport::transport_error(StatusCode::PAYLOAD_TOO_LARGE);
        }

        let transport = Arc::new(TransportIdentity::http(
            remote,
            header(&req, HOST),
            header(&req, COOKIE),
        ));

        let body = match Limited::new(req.into_body(), MAX_FRAME_SIZE).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return HttpTransport::transport_error(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                tracing::debug!("Failed to read request body: {}", e);
                return HttpTransport::transport_error(StatusCode::BAD_REQUEST);
            }
        };

        let target = path
            .strip_prefix("/api/")
            .filter(|t| !t.is_empty())
            .map(|t| t.trim_end_matches('/').to_string());

        let call = match parse_call(&body, target) {
            Ok(call) => call,
            Err(e) => {
                let id = salvage_call_id(&body);
                tracing::info!(target: "keel::access", "{}\t-\t{}", remote.ip(), e);
                return HttpTransport::envelope_with_status(
                    StatusCode::BAD_REQUEST,
                    &ResponseEnvelope::failure(id, &e),
                );
            }
        };

        let reply = self.channel.call(call, &transport).await;
        let mut response = HttpTransport::envelope(&reply);
        for cookie in transport.take_cookies() {
            response = HttpTransport::with_cookie(response, &cookie);
        }
        response
    }
}

fn header<'a>(req: &'a HyperRequest, name: hyper::header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Builds the call from the body and the optional path target. The path
/// target wins over the envelope's.
fn parse_call(body: &[u8], target: Option<String>) -> Result<CallEnvelope> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| KeelError::Structural(format!("invalid JSON: {}", e)))?
    };

    match target {
        None => match Packet::classify(value)? {
            Packet::Call(call) => Ok(call),
            _ => Err(KeelError::Structural("expected a call envelope".into())),
        },
        Some(target) => match Packet::classify(value.clone()) {
            Ok(Packet::Call(call)) => Ok(CallEnvelope::new(call.id, target, call.args)),
            _ => Ok(CallEnvelope::new(1, target, value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope_body() {
        let body = br#"{"call": 4, "signIn": {"login": "marcus"}}"#;
        let call = parse_call(body, None).unwrap();
        assert_eq!(call.id, 4);
        assert_eq!(call.target, "signIn");
        assert_eq!(call.args, json!({"login": "marcus"}));
    }

    #[test]
    fn test_path_target_wins() {
        let body = br#"{"call": 8, "other": [1, 2]}"#;
        let call = parse_call(body, Some("example/resources".into())).unwrap();
        assert_eq!(call.id, 8);
        assert_eq!(call.target, "example/resources");
        assert_eq!(call.args, json!([1, 2]));
    }

    #[test]
    fn test_bare_arguments_get_call_one() {
        let call = parse_call(br#"{"page": 2}"#, Some("list".into())).unwrap();
        assert_eq!(call.id, 1);
        assert_eq!(call.args, json!({"page": 2}));

        let call = parse_call(b"", Some("list".into())).unwrap();
        assert_eq!(call.args, Value::Null);
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            parse_call(b"{not json", None),
            Err(KeelError::Structural(_))
        ));
        assert!(matches!(
            parse_call(br#"{"callback": 1, "result": 2}"#, None),
            Err(KeelError::Structural(_))
        ));
        assert!(matches!(
            parse_call(br#"{"call": 1, "a": 1, "b": 2}"#, None),
            Err(KeelError::Structural(_))
        ));
        assert!(matches!(
            parse_call(b"{not json", Some("x".into())),
            Err(KeelError::Structural(_))
        ));
    }
}
