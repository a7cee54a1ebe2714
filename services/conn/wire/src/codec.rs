//! Async encoding and decoding of frames on byte streams.
//!
//! Writers must be serialized per connection: `write_frame` issues the prefix
//! and the payload as two writes, so two concurrent callers on the same
//! stream would interleave.

use crate::frame::{validate_len, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use crate::WireError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Write one frame (length prefix, then payload) and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    mut writer: W,
    payload: &[u8],
) -> Result<(), WireError> {
    if payload.is_empty() {
        return Err(WireError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let prefix = (payload.len() as u32).to_be_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    trace!("Wrote frame with {} payload bytes", payload.len());
    Ok(())
}

/// Read exactly one frame and return its payload
///
/// The length prefix is validated before any payload byte is consumed, so an
/// invalid length leaves the rest of the stream untouched.
pub async fn read_frame<R: AsyncRead + Unpin>(mut reader: R) -> Result<Bytes, WireError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let len = validate_len(u32::from_be_bytes(prefix))?;

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;

    trace!("Read frame with {} payload bytes", len);
    Ok(payload.freeze())
}
