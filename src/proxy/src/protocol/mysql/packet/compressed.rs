//! Compressed framing of the classic protocol.
//!
//! Each compressed frame wraps one or more classic frames:
//! `{u24 compressed-size, u8 seq, u24 uncompressed-size}` followed by the
//! body. `uncompressed-size == 0` means the body is stored verbatim. The
//! algorithm is zlib-deflate (`CLIENT_COMPRESS`).

use crate::protocol::mysql::constants::{COMPRESSED_HEADER_LEN, MIN_COMPRESS_LENGTH};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use std::io;
use std::io::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Frame one chunk of the classic-frame stream.
///
/// Short payloads are stored verbatim; so are payloads the deflate pass
/// fails to shrink.
pub fn encode_compressed_frame(seq: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    let (body, uncompressed_size) = if payload.len() < MIN_COMPRESS_LENGTH {
        (payload.to_vec(), 0usize)
    } else {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;
        if compressed.len() >= payload.len() {
            (payload.to_vec(), 0)
        } else {
            (compressed, payload.len())
        }
    };

    let mut out = Vec::with_capacity(COMPRESSED_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(&(uncompressed_size as u32).to_le_bytes()[..3]);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one compressed frame off `input`.
///
/// Returns `(bytes_consumed, seq, payload)` or `None` when the buffer does
/// not hold the whole frame yet.
pub fn decode_compressed_frame(input: &[u8]) -> io::Result<Option<(usize, u8, Vec<u8>)>> {
    if input.len() < COMPRESSED_HEADER_LEN {
        return Ok(None);
    }
    let compressed_size = u32::from_le_bytes([input[0], input[1], input[2], 0]) as usize;
    let seq = input[3];
    let uncompressed_size = u32::from_le_bytes([input[4], input[5], input[6], 0]) as usize;

    if input.len() < COMPRESSED_HEADER_LEN + compressed_size {
        return Ok(None);
    }
    let body = &input[COMPRESSED_HEADER_LEN..COMPRESSED_HEADER_LEN + compressed_size];

    let payload = if uncompressed_size == 0 {
        // stored verbatim
        body.to_vec()
    } else {
        let mut decoder = ZlibDecoder::new(body);
        let mut payload = Vec::with_capacity(uncompressed_size);
        decoder.read_to_end(&mut payload)?;
        if payload.len() != uncompressed_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "compressed frame announced {uncompressed_size} bytes, inflated to {}",
                    payload.len()
                ),
            ));
        }
        payload
    };

    Ok(Some((COMPRESSED_HEADER_LEN + compressed_size, seq, payload)))
}

/// Duplex adapter that puts the compressed framing between a raw stream
/// and the classic framer.
///
/// Reads inflate whole compressed frames into an internal buffer the
/// classic [`PacketReader`](super::packet_reader::PacketReader) then
/// consumes; writes buffer classic-frame bytes and emit one compressed
/// frame per flush.
pub struct CompressedStream<S> {
    inner: S,
    read_raw: Vec<u8>,
    read_plain: Vec<u8>,
    read_pos: usize,
    write_plain: Vec<u8>,
    write_pending: Vec<u8>,
    write_pos: usize,
    read_seq: u8,
    write_seq: u8,
}

impl<S> CompressedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_leftover(inner, Vec::new())
    }

    /// Bytes already read off the socket before the switch to compressed
    /// framing belong to the compressed stream.
    pub fn with_leftover(inner: S, leftover: Vec<u8>) -> Self {
        Self {
            inner,
            read_raw: leftover,
            read_plain: Vec::new(),
            read_pos: 0,
            write_plain: Vec::new(),
            write_pending: Vec::new(),
            write_pos: 0,
            read_seq: 0,
            write_seq: 0,
        }
    }

    /// Sequence counters restart at each command boundary, like the
    /// classic framer's.
    pub fn reset_seq(&mut self) {
        self.read_seq = 0;
        self.write_seq = 0;
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompressedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // serve inflated bytes first
            if self.read_pos < self.read_plain.len() {
                let n = (self.read_plain.len() - self.read_pos).min(buf.remaining());
                let start = self.read_pos;
                buf.put_slice(&self.read_plain[start..start + n]);
                self.read_pos += n;
                if self.read_pos == self.read_plain.len() {
                    self.read_plain.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if let Some((consumed, seq, payload)) = decode_compressed_frame(&self.read_raw)? {
                self.read_raw.drain(..consumed);
                self.read_seq = seq.wrapping_add(1);
                self.read_plain = payload;
                self.read_pos = 0;
                continue;
            }

            // need more raw bytes
            let mut chunk = [0u8; 4096];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.inner).poll_read(cx, &mut chunk_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = chunk_buf.filled();
                    if filled.is_empty() {
                        // EOF from the peer
                        return Poll::Ready(Ok(()));
                    }
                    let filled = filled.to_vec();
                    self.read_raw.extend_from_slice(&filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> CompressedStream<S> {
    /// Drain `write_pending` into the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_pending.len() {
            let pos = self.write_pos;
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_pending[pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => self.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write_pending.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompressedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.write_plain.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.write_plain.is_empty() {
            let plain = std::mem::take(&mut self.write_plain);
            let seq = self.write_seq;
            self.write_seq = self.write_seq.wrapping_add(1);
            let frame = encode_compressed_frame(seq, &plain)?;
            self.write_pending.extend_from_slice(&frame);
        }

        match self.as_mut().poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn small_payload_stored_verbatim() {
        let frame = encode_compressed_frame(0, b"hello").unwrap();
        // uncompressed-size == 0 marks a stored body
        assert_eq!(&frame[4..7], &[0, 0, 0]);
        let (consumed, seq, payload) = decode_compressed_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(seq, 0);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn large_payload_deflates() {
        let payload = vec![b'x'; 4096];
        let frame = encode_compressed_frame(3, &payload).unwrap();
        assert!(frame.len() < payload.len());
        assert_ne!(&frame[4..7], &[0, 0, 0]);
        let (_, seq, inflated) = decode_compressed_frame(&frame).unwrap().unwrap();
        assert_eq!(seq, 3);
        assert_eq!(inflated, payload);
    }

    #[test]
    fn partial_frame_needs_more_input() {
        let frame = encode_compressed_frame(0, b"hello").unwrap();
        assert!(decode_compressed_frame(&frame[..3]).unwrap().is_none());
        assert!(decode_compressed_frame(&frame[..frame.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn announced_size_mismatch_is_invalid() {
        let payload = vec![b'x'; 4096];
        let mut frame = encode_compressed_frame(0, &payload).unwrap();
        // tamper with the announced uncompressed size
        frame[4] = frame[4].wrapping_add(1);
        let err = decode_compressed_frame(&frame).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = CompressedStream::new(a);
        let mut reader = CompressedStream::new(b);

        let message: Vec<u8> = (0..1024u32).flat_map(|v| v.to_le_bytes()).collect();
        writer.write_all(&message).await.unwrap();
        writer.flush().await.unwrap();

        let mut out = vec![0u8; message.len()];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(out, message);
    }
}
