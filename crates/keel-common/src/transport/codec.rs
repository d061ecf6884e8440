//! Length-prefixed JSON framing for persistent connections.
//!
//! Wire format: `[u32 big-endian length][JSON envelope]`.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{KeelError, Result};
use crate::protocol::Packet;

/// Maximum frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes and decodes envelopes as JSON bytes.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode(value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
        Self::encode(&packet.to_value())
    }

    pub fn decode_packet(data: &[u8]) -> Result<Packet> {
        Packet::from_slice(data)
    }
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A frame larger than [`MAX_FRAME_SIZE`] is a transport error and
/// the connection should be dropped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(KeelError::Transport(format!("Failed to read length: {}", e)));
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(KeelError::Transport(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| KeelError::Transport(format!("Failed to read frame: {}", e)))?;
    Ok(Some(buf))
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(KeelError::Transport(format!(
            "Frame too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = data.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| KeelError::Transport(format!("Failed to send length: {}", e)))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| KeelError::Transport(format!("Failed to send frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| KeelError::Transport(format!("Failed to flush: {}", e)))?;
    Ok(())
}

/// Encodes `value` and writes it as one frame.
pub async fn write_value<W>(writer: &mut W, value: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = JsonCodec::encode(value)?;
    write_frame(writer, &encoded).await
}
