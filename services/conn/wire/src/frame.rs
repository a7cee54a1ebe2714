//! Frame layout, limits and buffered decoding.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload carried by a single frame (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Check a length prefix read off the wire.
pub fn validate_len(len: u32) -> Result<usize, WireError> {
    let len_usize = len as usize;
    if len == 0 || len_usize > MAX_PAYLOAD_SIZE {
        return Err(WireError::InvalidLength(len));
    }
    Ok(len_usize)
}

/// Encode a payload into a single contiguous frame
pub fn encode(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.is_empty() {
        return Err(WireError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Frame decoder for parsing frames out of an accumulating buffer
///
/// Unlike [`crate::read_frame`] this never blocks: it returns `Ok(None)` until
/// a whole frame is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Validated length of the frame currently being assembled
    pending_len: Option<usize>,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one payload from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                // Need at least 4 bytes for the length prefix
                if buf.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let len = validate_len(raw)?;
                buf.advance(LENGTH_PREFIX_SIZE);
                self.pending_len = Some(len);
                len
            }
        };

        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        self.pending_len = None;
        Ok(Some(buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_encode_limits() {
        assert!(matches!(encode(&[]), Err(WireError::EmptyPayload)));

        let max = vec![7u8; MAX_PAYLOAD_SIZE];
        assert_eq!(encode(&max).unwrap().len(), MAX_PAYLOAD_SIZE + 4);

        let over = vec![7u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode(&over),
            Err(WireError::PayloadTooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1
        ));
    }

    #[test]
    fn test_decoder_partial_input() {
        let frame = encode(b"partial frame").unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; nothing comes out until the last byte
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let out = decoder.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(out.is_none());
            } else {
                assert_eq!(out.unwrap().as_ref(), b"partial frame");
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode(b"a").unwrap());
        buf.put_slice(&encode(b"bb").unwrap());
        buf.put_slice(&encode(b"ccc").unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), b"a");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), b"bb");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), b"ccc");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decoder_rejects_bad_length() {
        let mut decoder = FrameDecoder::new();

        let mut zero = BytesMut::from(&[0u8, 0, 0, 0, 1][..]);
        assert!(matches!(decoder.decode(&mut zero), Err(WireError::InvalidLength(0))));

        let too_big = (MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes();
        let mut buf = BytesMut::from(&too_big[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_violation());
        // Prefix is left in place; the caller is expected to drop the connection
        assert_eq!(buf.len(), 4);
    }
}
