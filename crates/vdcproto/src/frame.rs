//! Length-prefixed framing for the vDC API stream.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────┐
//! │ Length (2B)  │ Payload (variable)              │
//! │ u16 BE       │ encoded envelope                │
//! └──────────────┴─────────────────────────────────┘
//! ```
//!
//! Each message is prefixed with an unsigned 16-bit big-endian length, so a
//! single payload is capped at 65 535 bytes. Zero-length frames are legal
//! noise: the reader logs and skips them. A short read inside a payload means
//! the peer died mid-frame and is fatal to the session; a clean EOF at a
//! frame boundary is a normal close.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Maximum payload size representable by the prefix.
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Errors at the framing layer. All of these are fatal to a session except
/// where noted on the reader functions.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_SIZE}-byte frame limit")]
    TooLarge(usize),

    #[error("peer closed mid-frame: expected {expected} more payload bytes")]
    Truncated { expected: usize },

    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame a payload: length prefix plus payload in one buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame reassembly over arbitrarily chunked input.
///
/// Feed raw stream bytes with [`FrameDecoder::extend`] and drain complete
/// payloads with [`FrameDecoder::next_frame`]. Zero-length frames are skipped
/// silently. Message boundaries are reconstructed regardless of how the
/// transport chunked the bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete payload, if one has been assembled.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_SIZE {
                return None;
            }
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if len == 0 {
                self.buf.advance(LENGTH_PREFIX_SIZE);
                continue;
            }
            if self.buf.len() < LENGTH_PREFIX_SIZE + len {
                return None;
            }
            self.buf.advance(LENGTH_PREFIX_SIZE);
            return Some(self.buf.split_to(len).freeze());
        }
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Read one framed payload from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. Zero-length frames
/// are logged and skipped. A decoded length above [`MAX_FRAME_SIZE`] is a
/// protocol violation; the u16 prefix cannot express one, but the bound is
/// enforced here so the invariant lives at this layer.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(prefix) as usize;
        if len == 0 {
            debug!("skipping zero-length frame");
            continue;
        }
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload).await {
            Ok(_) => return Ok(Some(Bytes::from(payload))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncated { expected: len });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write one framed payload: prefix and body queued as a single write, then
/// flushed so the peer sees the message immediately.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_frame(payload)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_length() {
        let framed = encode_frame(b"hello").unwrap();
        assert_eq!(&framed[..2], &[0x00, 0x05]);
        assert_eq!(&framed[2..], b"hello");
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&big),
            Err(FrameError::TooLarge(n)) if n == MAX_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn decoder_reassembles_across_chunks() {
        let framed = encode_frame(b"split me apart").unwrap();
        let mut decoder = FrameDecoder::new();

        // Feed one byte at a time; the frame must only pop once complete.
        for byte in framed.iter() {
            assert!(decoder.next_frame().is_none());
            decoder.extend(&[*byte]);
        }
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"split me apart");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_splits_coalesced_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(b"one").unwrap());
        stream.extend_from_slice(&encode_frame(b"two").unwrap());
        stream.extend_from_slice(&encode_frame(b"three").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"one");
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"two");
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"three");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn decoder_skips_zero_length_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 0x00]);
        decoder.extend(&encode_frame(b"after noise").unwrap());
        assert_eq!(decoder.next_frame().unwrap().as_ref(), b"after noise");
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, b"ping me").await.unwrap();
        let payload = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"ping me");
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_payload_is_fatal() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Announce 10 bytes but deliver only 4.
        client.write_all(&[0x00, 0x0A, 1, 2, 3, 4]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::Truncated { expected: 10 })
        ));
    }

    #[tokio::test]
    async fn zero_length_frames_skipped_on_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x00, 0x00]).await.unwrap();
        write_frame(&mut client, b"real").await.unwrap();
        let payload = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"real");
    }
}
