//! Native messaging framing: every message is a JSON document preceded by its
//! length as a 32-bit integer in native byte order.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, BridgeResult};

/// Largest message a browser accepts from a native host.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> BridgeResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(BridgeError::Channel(format!(
                "stream ended inside frame header ({filled} of 4 bytes)"
            )));
        }
        filled += n;
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(BridgeError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame_bytes}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|error| {
        if error.kind() == ErrorKind::UnexpectedEof {
            BridgeError::Channel(format!("stream ended inside {len}-byte frame body"))
        } else {
            BridgeError::Io(error)
        }
    })?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| BridgeError::Protocol(format!("frame of {} bytes too large", body.len())))?;
    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
