//! Persistent framed TCP transport
//!
//! Each connection carries `[u32 length][JSON envelope]` frames in both
//! directions. Calls on one connection run concurrently; responses are
//! written in completion order and correlated by call id. Events produced by
//! methods are pushed on the same connection.
//!
//! A connection that stays silent for the connection timeout receives a
//! single `{callback: 0, error: {code: 504}}` frame and is closed. Results
//! that complete afterwards are dropped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_common::transport::{read_frame, write_value};
use keel_common::{
    salvage_call_id, CallId, ErrorBody, EventEnvelope, KeelError, Packet, ResponseEnvelope, Result,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::channel::Channel;
use crate::identity::TransportIdentity;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a persistent connection.
///
/// Enforces at most one response per call id and no writes once the
/// connection is closed.
pub struct Responder {
    writer: tokio::sync::Mutex<Writer>,
    closed: AtomicBool,
    pending: Mutex<HashSet<CallId>>,
}

impl Responder {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Registers an incoming call. Returns `false` when a call with the same
    /// id is still unanswered, and for the reserved id `0`.
    pub fn begin(&self, id: CallId) -> bool {
        id != 0 && self.pending.lock().insert(id)
    }

    /// Writes the response for a registered call. Returns whether it was
    /// written; a second response for the same id, or any response after
    /// close, is dropped.
    ///
    /// Call id `0` is reserved for replies to packets that could not be
    /// correlated and is always allowed.
    pub async fn send(&self, envelope: &ResponseEnvelope) -> Result<bool> {
        if envelope.callback != 0 && !self.pending.lock().remove(&envelope.callback) {
            tracing::warn!(callback = envelope.callback, "Dropping duplicate response");
            return Ok(false);
        }
        self.write(&envelope.to_value()).await
    }

    /// Pushes an event to the peer.
    pub async fn emit(&self, event: &EventEnvelope) -> Result<()> {
        if self.write(&event.to_value()).await? {
            Ok(())
        } else {
            Err(KeelError::Transport("connection closed".into()))
        }
    }

    async fn write(&self, value: &serde_json::Value) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Ok(false);
        }
        if let Err(e) = write_value(&mut *writer, value).await {
            self.closed.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    /// Reports the inactivity timeout to the peer and closes. Only the first
    /// call writes anything.
    pub async fn expire(&self, timeout_ms: u64) {
        let mut writer = self.writer.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let envelope = ResponseEnvelope::error(0, ErrorBody::from_code(504));
        if let Err(e) = write_value(&mut *writer, &envelope.to_value()).await {
            tracing::debug!("Failed to report timeout: {}", e);
        }
        let _ = writer.shutdown().await;
        tracing::debug!(timeout_ms, "Connection expired");
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Accept loop for the persistent transport.
pub struct SocketServer {
    channel: Arc<Channel>,
    connection_timeout: Duration,
}

impl SocketServer {
    pub fn new(channel: Arc<Channel>, connection_timeout: Duration) -> Self {
        Self {
            channel,
            connection_timeout,
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| KeelError::Transport(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Serves connections until `shutdown` turns `true`. Open connections
    /// are left to finish on their own.
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| KeelError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("Socket server listening on {}", local);

        let server = Arc::new(self);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let server = server.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Socket server on {} stopped accepting", local);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        self.serve_stream(reader, writer, peer).await;
    }

    /// Runs the read loop of one connection over any byte stream.
    pub async fn serve_stream<R, W>(&self, mut reader: R, writer: W, peer: SocketAddr)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let responder = Arc::new(Responder::new(writer));
        let identity = Arc::new(TransportIdentity::socket(peer, responder.clone()));
        let metrics = self.channel.metrics().clone();
        metrics.connection_opened();
        tracing::debug!("Connection established from {}", peer);

        loop {
            let frame = match tokio::time::timeout(self.connection_timeout, read_frame(&mut reader)).await
            {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    tracing::warn!("Connection from {} failed: {}", peer, e);
                    break;
                }
                Err(_) => {
                    responder
                        .expire(self.connection_timeout.as_millis() as u64)
                        .await;
                    break;
                }
            };

            let packet = match Packet::from_slice(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    let id = salvage_call_id(&frame);
                    tracing::warn!("Malformed packet from {}: {}", peer, e);
                    if id == 0 || responder.begin(id) {
                        let _ = responder.send(&ResponseEnvelope::failure(id, &e)).await;
                    }
                    continue;
                }
            };

            match packet {
                Packet::Call(call) => {
                    if !responder.begin(call.id) {
                        tracing::warn!(call = call.id, "Call id already in flight, ignoring");
                        continue;
                    }
                    let channel = self.channel.clone();
                    let identity = identity.clone();
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        let reply = channel.call(call, &identity).await;
                        if let Err(e) = responder.send(&reply).await {
                            tracing::debug!("Failed to write response: {}", e);
                        }
                    });
                }
                other => self.channel.packet(other, &identity),
            }
        }

        responder.close();
        metrics.connection_closed();
        tracing::debug!("Connection from {} closed", peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    async fn next(reader: &mut tokio::io::DuplexStream) -> Value {
        let frame = read_frame(reader).await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_response_written_once() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new(server);

        assert!(responder.begin(7));
        assert!(!responder.begin(7));
        assert!(responder
            .send(&ResponseEnvelope::success(7, json!("first")))
            .await
            .unwrap());
        assert!(!responder
            .send(&ResponseEnvelope::success(7, json!("second")))
            .await
            .unwrap());

        assert_eq!(next(&mut client).await, json!({"callback": 7, "result": "first"}));
    }

    #[tokio::test]
    async fn test_reserved_call_id_never_pending() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new(server);

        let err = Packet::from_slice(br#"{"call": 0, "status": {}}"#).unwrap_err();
        for _ in 0..2 {
            assert!(!responder.begin(0));
            assert!(responder
                .send(&ResponseEnvelope::failure(0, &err))
                .await
                .unwrap());
            let reply = next(&mut client).await;
            assert_eq!(reply["callback"], 0);
            assert_eq!(reply["error"]["code"], 400);
        }

        // Ordinary ids are unaffected
        assert!(responder.begin(1));
    }

    #[tokio::test]
    async fn test_expire_writes_single_timeout() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new(server);
        assert!(responder.begin(1));

        responder.expire(30_000).await;
        responder.expire(30_000).await;
        assert!(responder.is_closed());
        assert!(!responder
            .send(&ResponseEnvelope::success(1, json!("late")))
            .await
            .unwrap());
        assert!(responder
            .emit(&EventEnvelope::new("tick", "clock", json!(1)))
            .await
            .is_err());

        let reply = next(&mut client).await;
        assert_eq!(reply["callback"], 0);
        assert_eq!(reply["error"]["code"], 504);
        assert!(read_frame(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_shape() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new(server);
        responder
            .emit(&EventEnvelope::new("progress", "example/job", json!({"done": 3})))
            .await
            .unwrap();
        assert_eq!(
            next(&mut client).await,
            json!({"event": "progress", "example/job": {"done": 3}})
        );
    }
}
