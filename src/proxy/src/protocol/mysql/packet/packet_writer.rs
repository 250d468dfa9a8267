use crate::protocol::mysql::constants;
use byteorder::{ByteOrder, LittleEndian};

use std::io;
use std::io::prelude::*;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one logical payload, then frames it on `end_packet`: split at
/// the 16M boundary, each chunk stamped with the running sequence-id.
#[derive(Clone)]
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn into_inner(self) -> W {
        self.inner_writer
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for PacketWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner_writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner_writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner_writer).poll_shutdown(cx)
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    async fn write_frame(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        LittleEndian::write_u24(&mut header, chunk.len() as u32);
        header[3] = self.seq();
        self.increase_seq();

        // depending on the AsyncWrite provided, this may trigger a real
        // system call or not (e.g. when it is a buffered stream)
        let written = self
            .inner_writer
            .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
            .await?;

        // if the vectored write did not drain, fall back to write_all
        if written != constants::PACKET_HEADER_LEN + chunk.len() {
            let remaining: Vec<u8> = header
                .iter()
                .chain(chunk.iter())
                .skip(written)
                .cloned()
                .collect();
            self.inner_writer.write_all(&remaining).await?;
        }
        Ok(())
    }

    pub async fn end_packet(&mut self) -> io::Result<()> {
        if self.is_empty() {
            // packet with an empty payload; currently only an empty
            // password reply looks like this.
            return self.write_frame(&[]).await;
        }

        let raw_packet = self.take_buffer();
        for chunk in raw_packet.chunks(constants::MAX_PAYLOAD_LEN) {
            self.write_frame(chunk).await?;
        }
        // a payload ending exactly on the 16M boundary is terminated by an
        // empty frame.
        if raw_packet.len() % constants::MAX_PAYLOAD_LEN == 0 {
            self.write_frame(&[]).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;

    #[tokio::test]
    async fn frames_small_payload() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            std::io::Write::write_all(&mut writer, &[0x0e]).unwrap();
            writer.end_packet().await.unwrap();
        }
        assert_eq!(out, vec![0x01, 0x00, 0x00, 0x00, 0x0e]);
    }

    #[tokio::test]
    async fn seq_continues_across_packets() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer.set_seq(1);
            std::io::Write::write_all(&mut writer, b"a").unwrap();
            writer.end_packet().await.unwrap();
            std::io::Write::write_all(&mut writer, b"b").unwrap();
            writer.end_packet().await.unwrap();
        }
        assert_eq!(out[3], 1);
        assert_eq!(out[8], 2);
    }

    #[tokio::test]
    async fn splits_at_16mb_and_terminates_with_empty_frame() {
        let payload = vec![0x42u8; constants::MAX_PAYLOAD_LEN];
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            std::io::Write::write_all(&mut writer, &payload).unwrap();
            writer.end_packet().await.unwrap();
        }
        // full frame + empty terminator frame
        assert_eq!(
            out.len(),
            constants::PACKET_HEADER_LEN * 2 + constants::MAX_PAYLOAD_LEN
        );

        let mut reader = PacketReader::new(std::io::Cursor::new(out));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), constants::MAX_PAYLOAD_LEN);
    }
}
