pub mod compressed;
pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::codec::{CodecError, CodecResult, MessageEncode};
use crate::protocol::mysql::constants::{HeaderInfo, MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};

use mysql_common::constants::CapabilityFlags;
use std::ops::Deref;

/// One logical message payload of the classic protocol, with continuation
/// frames already concatenated. The maximum size of a single frame is
/// 16M-1; larger messages arrive split.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }

    /// OK packet after the result set when CLIENT_DEPRECATE_EOF is enabled:
    /// header is 0xfe but the packet is longer than the legacy EOF.
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..MAX_PAYLOAD_LEN).contains(&self.0.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }

    pub fn is_auth_switch_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() > 5
    }

    pub fn is_auth_more_data_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == 0x01
    }

    pub fn command_byte(&self) -> Option<u8> {
        self.0.first().copied()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

/// Encode a single frame: `{u24 payload-size, u8 seq-id}` header followed
/// by the payload. Only usable for payloads below the 16M split point; the
/// writer handles splitting.
pub fn encode_frame<M: MessageEncode>(
    seq_id: u8,
    payload: &M,
    caps: CapabilityFlags,
) -> CodecResult<Vec<u8>> {
    let payload_size = payload.size(caps)?;
    if payload_size >= MAX_PAYLOAD_LEN {
        return Err(CodecError::InvalidInput);
    }

    let mut out = vec![0u8; PACKET_HEADER_LEN + payload_size];
    out[..3].copy_from_slice(&(payload_size as u32).to_le_bytes()[..3]);
    out[3] = seq_id;
    let written = payload.encode_to(&mut out[PACKET_HEADER_LEN..], caps)?;
    debug_assert_eq!(written, payload_size);
    Ok(out)
}

/// Decode a single frame, handing the payload slice to `decode_payload`.
///
/// The buffer must hold the whole frame (`4 + payload-size` bytes),
/// otherwise `NotEnoughInput`; the payload codec sees exactly the frame's
/// payload.
pub fn decode_frame<'a, T, F>(
    input: &'a [u8],
    caps: CapabilityFlags,
    decode_payload: F,
) -> CodecResult<(usize, (u8, T))>
where
    F: FnOnce(&'a [u8], CapabilityFlags) -> CodecResult<(usize, T)>,
{
    if input.len() < PACKET_HEADER_LEN {
        return Err(CodecError::NotEnoughInput);
    }
    let payload_size =
        u32::from_le_bytes([input[0], input[1], input[2], 0]) as usize;
    let seq_id = input[3];

    if input.len() < PACKET_HEADER_LEN + payload_size {
        return Err(CodecError::NotEnoughInput);
    }

    let payload = &input[PACKET_HEADER_LEN..PACKET_HEADER_LEN + payload_size];
    let (payload_consumed, value) = decode_payload(payload, caps)?;
    if payload_consumed != payload_size {
        return Err(CodecError::InvalidInput);
    }

    Ok((PACKET_HEADER_LEN + payload_size, (seq_id, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::codec::client::Quit;

    #[test]
    fn quit_frame_bytes() {
        let caps = CapabilityFlags::empty();
        let bytes = encode_frame(0, &Quit, caps).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0x00, 0x00, 0x01]);

        let (consumed, (seq, _quit)) =
            decode_frame(&bytes, caps, Quit::decode).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(seq, 0);
    }

    #[test]
    fn frame_short_read() {
        let caps = CapabilityFlags::empty();
        let bytes = encode_frame(0, &Quit, caps).unwrap();
        for cut in 1..bytes.len() {
            assert_eq!(
                decode_frame(&bytes[..bytes.len() - cut], caps, Quit::decode)
                    .unwrap_err(),
                CodecError::NotEnoughInput
            );
        }
    }

    #[test]
    fn packet_header_predicates() {
        assert!(Packet::from_vec(vec![0x00, 0x00, 0x00]).is_ok_packet());
        assert!(Packet::from_vec(vec![0xff, 0x15, 0x04]).is_err_packet());
        assert!(Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00]).is_eof_packet());
        assert!(!Packet::from_vec(vec![0xfe; 9]).is_eof_packet());
        assert!(Packet::from_vec(vec![0xfe; 9]).is_result_set_eof_packet());
        assert!(Packet::from_vec(vec![0xfb, b'x']).is_local_in_file_packet());
    }
}
