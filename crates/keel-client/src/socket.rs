use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use keel_common::transport::{read_frame, write_value};
use keel_common::{CallEnvelope, CallId, EventEnvelope, KeelError, Packet, ResponseEnvelope, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Pending = Arc<Mutex<HashMap<CallId, oneshot::Sender<ResponseEnvelope>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Keel client over one persistent framed connection.
///
/// Calls may run concurrently; replies are matched to callers by call id.
/// Events pushed by the server are delivered through [`SocketClient::events`].
pub struct SocketClient {
    writer: tokio::sync::Mutex<Writer>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    notices: Mutex<Option<mpsc::UnboundedReceiver<ResponseEnvelope>>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl SocketClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| KeelError::Transport(format!("Failed to connect: {}", e)))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(reader, writer))
    }

    /// Client over an already established byte stream.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            closed.clone(),
            event_tx,
            notice_tx,
        ));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            closed,
            events: Mutex::new(Some(event_rx)),
            notices: Mutex::new(Some(notice_rx)),
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Attaches a session token to the connection.
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        self.write(&json!({ "token": token })).await
    }

    pub async fn call(&self, method: impl Into<String>, args: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&CallEnvelope::new(id, method, args))
            .await?
            .into_result()
    }

    /// Sends one envelope and waits for the reply with the same id.
    pub async fn send(&self, call: &CallEnvelope) -> Result<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call.id, tx);
        if self.is_closed() {
            self.pending.lock().remove(&call.id);
            return Err(KeelError::Transport("connection closed".into()));
        }
        if let Err(e) = self.write(&call.to_value()).await {
            self.pending.lock().remove(&call.id);
            return Err(e);
        }
        rx.await
            .map_err(|_| KeelError::Transport("connection closed before reply".into()))
    }

    /// Writes an arbitrary JSON value as one frame.
    pub async fn write(&self, value: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_value(&mut *writer, value).await
    }

    /// Whether the server side of the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver of server-pushed events. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<EventEnvelope>> {
        self.events.lock().take()
    }

    /// Receiver of uncorrelated replies (`callback: 0`), such as the
    /// connection timeout notice. Can be taken once.
    pub fn notices(&self) -> Option<mpsc::UnboundedReceiver<ResponseEnvelope>> {
        self.notices.lock().take()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Pending,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EventEnvelope>,
    notices: mpsc::UnboundedSender<ResponseEnvelope>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Connection read failed: {}", e);
                break;
            }
        };
        match Packet::from_slice(&frame) {
            Ok(Packet::Response(response)) => {
                let waiter = pending.lock().remove(&response.callback);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => {
                        let _ = notices.send(response);
                    }
                }
            }
            Ok(Packet::Event(event)) => {
                let _ = events.send(event);
            }
            Ok(_) => tracing::debug!("Ignoring unexpected packet from server"),
            Err(e) => tracing::warn!("Malformed packet from server: {}", e),
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding call
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::transport::write_value;

    #[tokio::test]
    async fn test_replies_matched_by_id() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Arc::new(SocketClient::from_parts(client_read, client_write));
        let (mut server_read, mut server_write) = tokio::io::split(server_io);

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.call("a", json!(1)).await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.call("b", json!(2)).await })
        };

        let mut ids = HashMap::new();
        for _ in 0..2 {
            let frame = read_frame(&mut server_read).await.unwrap().unwrap();
            let Packet::Call(call) = Packet::from_slice(&frame).unwrap() else {
                panic!("expected a call");
            };
            ids.insert(call.target.clone(), call.id);
        }

        // Answer out of order
        write_value(
            &mut server_write,
            &ResponseEnvelope::success(ids["b"], json!("B")).to_value(),
        )
        .await
        .unwrap();
        write_value(
            &mut server_write,
            &ResponseEnvelope::success(ids["a"], json!("A")).to_value(),
        )
        .await
        .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), json!("A"));
        assert_eq!(second.await.unwrap().unwrap(), json!("B"));
    }

    #[tokio::test]
    async fn test_events_and_notices() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = SocketClient::from_parts(client_read, client_write);
        let mut events = client.events().unwrap();
        let mut notices = client.notices().unwrap();
        assert!(client.events().is_none());

        let (_server_read, mut server_write) = tokio::io::split(server_io);
        write_value(
            &mut server_write,
            &json!({"event": "tick", "clock": {"n": 1}}),
        )
        .await
        .unwrap();
        write_value(
            &mut server_write,
            &json!({"callback": 0, "error": {"code": 504, "message": "Gateway Timeout"}}),
        )
        .await
        .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "tick");
        assert_eq!(event.target, "clock");
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.error.unwrap().code, 504);
    }

    #[tokio::test]
    async fn test_pending_calls_fail_on_close() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Arc::new(SocketClient::from_parts(client_read, client_write));

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", json!({})).await })
        };
        let (mut server_read, _server_write) = tokio::io::split(server_io);
        read_frame(&mut server_read).await.unwrap().unwrap();
        drop(server_read);
        drop(_server_write);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, KeelError::Transport(_)));
    }
}
