pub mod client;
pub mod server;
pub mod wire;

use mysql_common::constants::CapabilityFlags;
use thiserror::Error;

pub use wire::{DecodeBuf, EncodeBuf};

/// Errors a message codec can produce.
///
/// `NotEnoughInput` is recoverable: the caller may read more bytes off the
/// socket and retry. Everything else means the peer violated the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("not enough input to decode the message")]
    NotEnoughInput,
    #[error("input is not a valid message for the shared capabilities")]
    InvalidInput,
    #[error("output buffer too small for the encoded message")]
    BufferTooSmall,
    #[error("unknown field type in parameter metadata")]
    FieldTypeUnknown,
    #[error("no parameter metadata known for statement-id")]
    StatementIdNotFound,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Capability-aware message encoder.
///
/// `encode` runs the same field sequence whether the accumulator counts or
/// writes, so the size reported by [`MessageEncode::size`] is exactly the
/// number of bytes [`MessageEncode::encode_to`] produces.
pub trait MessageEncode {
    fn encode(&self, buf: &mut EncodeBuf<'_>, caps: CapabilityFlags) -> CodecResult<()>;

    /// Number of bytes `encode_to` will write under `caps`.
    fn size(&self, caps: CapabilityFlags) -> CodecResult<usize> {
        let mut sizer = EncodeBuf::sizer();
        self.encode(&mut sizer, caps)?;
        Ok(sizer.written())
    }

    /// Encode into a caller-supplied buffer, returning the bytes written.
    fn encode_to(&self, dst: &mut [u8], caps: CapabilityFlags) -> CodecResult<usize> {
        let mut buf = EncodeBuf::fixed(dst);
        self.encode(&mut buf, caps)?;
        Ok(buf.written())
    }

    fn encode_to_vec(&self, caps: CapabilityFlags) -> CodecResult<Vec<u8>> {
        let size = self.size(caps)?;
        let mut out = vec![0u8; size];
        let written = self.encode_to(&mut out, caps)?;
        debug_assert_eq!(written, size);
        Ok(out)
    }
}

/// Shared capabilities of a connection: both sides must offer a flag for any
/// codec branch to take it.
#[inline]
pub fn shared_capabilities(
    client: CapabilityFlags,
    server: CapabilityFlags,
) -> CapabilityFlags {
    client & server
}

/// Raw field-type bytes of the binary protocol.
pub mod field_type {
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONGLONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const VARCHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const JSON: u8 = 0xf5;
    pub const NEWDECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
    pub const GEOMETRY: u8 = 0xff;
}

/// How a binary-protocol value of `typ` is sized on the wire.
enum FieldSize {
    /// var-int length prefix
    VarPrefixed,
    /// one-byte length prefix (date/time family)
    BytePrefixed,
    Fixed(usize),
}

fn field_size_of(typ: u8) -> CodecResult<FieldSize> {
    use field_type as ft;

    match typ {
        ft::BIT | ft::BLOB | ft::VARCHAR | ft::VAR_STRING | ft::SET | ft::STRING | ft::ENUM
        | ft::TINY_BLOB | ft::MEDIUM_BLOB | ft::LONG_BLOB | ft::DECIMAL | ft::JSON
        | ft::NEWDECIMAL | ft::GEOMETRY => Ok(FieldSize::VarPrefixed),
        ft::DATE | ft::DATETIME | ft::TIMESTAMP | ft::TIME => Ok(FieldSize::BytePrefixed),
        ft::LONGLONG | ft::DOUBLE => Ok(FieldSize::Fixed(8)),
        ft::LONG | ft::INT24 | ft::FLOAT => Ok(FieldSize::Fixed(4)),
        ft::SHORT | ft::YEAR => Ok(FieldSize::Fixed(2)),
        ft::TINY => Ok(FieldSize::Fixed(1)),
        _ => Err(CodecError::FieldTypeUnknown),
    }
}

/// Read one binary-protocol value of `typ` off the cursor.
pub(crate) fn take_binary_field<'a>(
    dec: &mut DecodeBuf<'a>,
    typ: u8,
) -> CodecResult<&'a [u8]> {
    let size = match field_size_of(typ)? {
        FieldSize::VarPrefixed => {
            let n = dec.var_int()?;
            if n > usize::MAX as u64 {
                return Err(CodecError::InvalidInput);
            }
            n as usize
        }
        FieldSize::BytePrefixed => dec.u8()? as usize,
        FieldSize::Fixed(n) => n,
    };
    dec.take(size)
}

/// Write one binary-protocol value of `typ`, with the length prefix its
/// size class requires.
pub(crate) fn put_binary_field(
    buf: &mut EncodeBuf<'_>,
    typ: u8,
    value: &[u8],
) -> CodecResult<()> {
    match field_size_of(typ)? {
        FieldSize::VarPrefixed => buf.put_var_int(value.len() as u64)?,
        FieldSize::BytePrefixed => {
            if value.len() > u8::MAX as usize {
                return Err(CodecError::InvalidInput);
            }
            buf.put_u8(value.len() as u8)?;
        }
        FieldSize::Fixed(n) => {
            if value.len() != n {
                return Err(CodecError::InvalidInput);
            }
        }
    }
    buf.put_bytes(value)
}

/// Null-bitmap length for `count` fields.
#[inline]
pub(crate) fn bytes_per_bits(count: usize) -> usize {
    (count + 7) / 8
}
