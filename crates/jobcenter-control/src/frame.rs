//! Length-prefixed YAML frames.
//!
//! Each frame is an 8-byte big-endian length followed by that many bytes of
//! UTF-8 YAML.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Read one frame. `None` means the peer closed the stream cleanly.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Option<String>> {
    let len = match reader.read_u64().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ProtocolError::NotUtf8)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> ProtocolResult<()> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_u64(len).await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one YAML message.
pub async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> ProtocolResult<Option<T>> {
    match read_frame(reader).await? {
        Some(text) => Ok(Some(serde_yaml::from_str(&text)?)),
        None => Ok(None),
    }
}

pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &T,
) -> ProtocolResult<()> {
    let text = serde_yaml::to_string(message)?;
    write_frame(writer, &text).await
}
