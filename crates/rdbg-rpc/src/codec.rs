//! Length-prefixed binary plist framing.
//!
//! Each frame on the native inspector socket is a 4-byte big-endian length
//! followed by that many bytes of binary property list. The plist encoding
//! itself sits behind [`PlistCodec`] so the transport never touches the
//! serialization library directly.

use std::io::Cursor;

use plist::Value as PlistValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use rdbg_core::prelude::*;

/// Upper bound on a single inbound frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Converts between property-list values and bytes.
pub trait PlistCodec: Send + Sync {
    fn encode(&self, value: &PlistValue) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<PlistValue>;
}

/// Binary property list codec backed by the `plist` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryPlistCodec;

impl PlistCodec for BinaryPlistCodec {
    fn encode(&self, value: &PlistValue) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        value
            .to_writer_binary(&mut buf)
            .map_err(|e| Error::plist(format!("encode failed: {e}")))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<PlistValue> {
        PlistValue::from_reader(Cursor::new(bytes))
            .map_err(|e| Error::plist(format!("decode failed: {e}")))
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::protocol(format!(
                "stream ended inside a length prefix ({filled} of 4 bytes)"
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| Error::protocol(format!("frame of {} bytes is too large", body.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
