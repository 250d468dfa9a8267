use crate::protocol::mysql::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};
use crate::protocol::mysql::packet::Packet;

use std::io;
use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt};

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("SqlRouter read pkg err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// Parse one logical message off `buf`.
///
/// Frames whose payload is exactly 16M-1 continue into the next frame; the
/// continuation's sequence-id must follow the previous one or the peer has
/// lost frame sync.
///
/// Returns `(bytes_consumed, last_seq_id, packet)` or `None` when more
/// bytes are needed.
fn parse_message(buf: &[u8]) -> io::Result<Option<(usize, u8, Packet)>> {
    let mut pos = 0usize;
    let mut payload: Option<Packet> = None;
    let mut expected_seq: Option<u8> = None;

    loop {
        if buf.len() < pos + PACKET_HEADER_LEN {
            return Ok(None);
        }
        let payload_size =
            u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], 0]) as usize;
        let seq = buf[pos + 3];

        if let Some(expected) = expected_seq {
            if seq != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame sequence-id mismatch: expected {expected}, got {seq}"),
                ));
            }
        }

        if buf.len() < pos + PACKET_HEADER_LEN + payload_size {
            return Ok(None);
        }
        let frame_payload = &buf[pos + PACKET_HEADER_LEN..pos + PACKET_HEADER_LEN + payload_size];
        pos += PACKET_HEADER_LEN + payload_size;

        match payload.as_mut() {
            Some(pkt) => pkt.extend(frame_payload),
            None => payload = Some(Packet::from_vec(frame_payload.to_vec())),
        }

        if payload_size == MAX_PAYLOAD_LEN {
            // the message continues in the next frame
            expected_seq = Some(seq.wrapping_add(1));
            continue;
        }

        let Some(pkt) = payload.take() else {
            return Ok(None);
        };
        return Ok(Some((pos, seq, pkt)));
    }
}

/// Reads bytes off a stream and parses them into MySQL [`Packet`]s,
/// concatenating 16M continuation frames into one logical message.
#[derive(Clone)]
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    start: usize,
    remaining: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            start: 0,
            remaining: 0,
            r,
        }
    }

    /// Bytes read off the socket but not yet consumed as packets.
    pub fn buffered(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.remaining]
    }

    pub fn into_inner(self) -> R {
        self.r
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        self.remaining -= n;
    }
}

impl<R: Read> PacketReader<R> {
    pub fn next_read(&mut self) -> io::Result<Option<(u8, Packet)>> {
        loop {
            if self.remaining != 0 {
                if let Some((consumed, seq, pkt)) =
                    parse_message(&self.bytes[self.start..self.start + self.remaining])?
                {
                    self.consume(consumed);
                    return Ok(Some((seq, pkt)));
                }
            }

            // we need to read some more
            self.bytes.drain(..self.start);
            self.start = 0;
            let end = self.bytes.len();
            self.bytes.resize(std::cmp::max(PACKET_BUFFER_SIZE, end * 2), 0);
            let read = self.r.read(&mut self.bytes[end..])?;
            self.bytes.truncate(end + read);
            self.remaining = self.bytes.len();

            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ));
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if self.remaining != 0 {
                if let Some((consumed, seq, pkt)) =
                    parse_message(&self.bytes[self.start..self.start + self.remaining])?
                {
                    self.consume(consumed);
                    return Ok(Some((seq, pkt)));
                }
            }

            // we need to read some more
            self.bytes.drain(..self.start);
            self.start = 0;
            let end = self.remaining;

            if self.bytes.len() - end < buffer_size {
                let new_len = std::cmp::max(buffer_size, end * 2);
                self.bytes.resize(end + new_len, 0);
            }
            let read = self.r.read(&mut self.bytes[end..]).await?;
            self.remaining = end + read;
            self.bytes.truncate(self.remaining);
            // use a larger buffer size to reduce resize churn on big rows.
            buffer_size = PACKET_LARGE_BUFFER_SIZE;

            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn one_ping() {
        let mut reader = PacketReader::new(Cursor::new(vec![0x01, 0, 0, 0, 0x0e]));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x0e]);
        assert!(reader.next_read().unwrap().is_none());
    }

    #[test]
    fn two_messages_back_to_back() {
        let mut bytes = vec![0x01, 0, 0, 0, 0x0e];
        bytes.extend_from_slice(&[0x01, 0, 0, 1, 0x01]);
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!((seq, &pkt[..]), (0, &[0x0e][..]));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!((seq, &pkt[..]), (1, &[0x01][..]));
    }

    #[test]
    fn sixteen_mb_continuation() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend_from_slice(&[0x5a; MAX_PAYLOAD_LEN]);
        data.extend_from_slice(&[0x01, 0x00, 0x00, 1, 0x10]);

        let mut reader = PacketReader::new(Cursor::new(data));
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(pkt[MAX_PAYLOAD_LEN], 0x10);
    }

    #[test]
    fn continuation_seq_mismatch_is_an_error() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend_from_slice(&[0x00; MAX_PAYLOAD_LEN]);
        // continuation carries seq 5 instead of 1
        data.extend_from_slice(&[0x01, 0x00, 0x00, 5, 0x10]);

        let mut reader = PacketReader::new(Cursor::new(data));
        let err = reader.next_read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn async_read_across_chunks() {
        let (client, server) = tokio::io::duplex(16);
        let mut reader = PacketReader::new(server);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            // dribble a 5-byte frame in two writes
            client.write_all(&[0x03, 0x00, 0x00]).await.unwrap();
            client.write_all(&[0x00, 0x03, b'a', b'b']).await.unwrap();
        });

        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x03, b'a', b'b']);
    }
}
