//! Wire primitives of the classic protocol.
//!
//! Integers are little-endian. Length-encoded ("var") integers use the
//! first byte as a discriminator: `< 0xfb` literal, `0xfc` two more bytes,
//! `0xfd` three, `0xfe` eight. `0xfb` marks NULL where the message permits
//! it and `0xff` is reserved (the Error packet header).

use crate::protocol::mysql::codec::{CodecError, CodecResult};

const NULL_MARKER: u8 = 0xfb;

/// Decode cursor over a borrowed buffer.
///
/// Every step either returns a value and advances, or fails without
/// consuming anything the caller could retry on.
#[derive(Debug, Clone, Copy)]
pub struct DecodeBuf<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> DecodeBuf<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    #[inline]
    pub fn consumed(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    #[inline]
    pub fn peek_u8(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    pub fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::NotEnoughInput);
        }
        let out = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> CodecResult<()> {
        self.take(n).map(|_| ())
    }

    /// All bytes to the end of the payload.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.input[self.pos..];
        self.pos = self.input.len();
        out
    }

    /// Little-endian fixed integer of `n` bytes, n in 1..=8.
    pub fn fixed_int(&mut self, n: usize) -> CodecResult<u64> {
        debug_assert!((1..=8).contains(&n));
        let bytes = self.take(n)?;
        let mut out = [0u8; 8];
        out[..n].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(out))
    }

    #[inline]
    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.fixed_int(1)? as u8)
    }

    #[inline]
    pub fn u16_le(&mut self) -> CodecResult<u16> {
        Ok(self.fixed_int(2)? as u16)
    }

    #[inline]
    pub fn u24_le(&mut self) -> CodecResult<u32> {
        Ok(self.fixed_int(3)? as u32)
    }

    #[inline]
    pub fn u32_le(&mut self) -> CodecResult<u32> {
        Ok(self.fixed_int(4)? as u32)
    }

    #[inline]
    pub fn u64_le(&mut self) -> CodecResult<u64> {
        self.fixed_int(8)
    }

    /// Length-encoded integer. `0xfb` and `0xff` are invalid here.
    pub fn var_int(&mut self) -> CodecResult<u64> {
        match self.var_int_or_null()? {
            Some(v) => Ok(v),
            None => Err(CodecError::InvalidInput),
        }
    }

    /// Length-encoded integer that may be the NULL marker (`0xfb`).
    pub fn var_int_or_null(&mut self) -> CodecResult<Option<u64>> {
        let first = self.u8()?;
        let more = match first {
            NULL_MARKER => return Ok(None),
            0xff => return Err(CodecError::InvalidInput),
            0xfc => 2,
            0xfd => 3,
            0xfe => 8,
            b => return Ok(Some(u64::from(b))),
        };
        Ok(Some(self.fixed_int(more)?))
    }

    /// Bytes until (and not including) the next NUL.
    pub fn nul_term_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let rest = &self.input[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(&rest[..end])
            }
            None => Err(CodecError::NotEnoughInput),
        }
    }

    /// Length-encoded string: var-int length followed by that many bytes.
    pub fn var_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.var_int()?;
        if len > usize::MAX as u64 {
            return Err(CodecError::InvalidInput);
        }
        self.take(len as usize)
    }
}

enum Sink<'a> {
    Sizer,
    Fixed(&'a mut [u8]),
}

/// Encode accumulator.
///
/// The same `put_*` sequence runs once against a [`EncodeBuf::sizer`] to
/// learn the total size and once against a fixed buffer to write the bytes;
/// a fixed buffer that runs out yields `BufferTooSmall`.
pub struct EncodeBuf<'a> {
    sink: Sink<'a>,
    written: usize,
}

impl<'a> EncodeBuf<'a> {
    pub fn sizer() -> EncodeBuf<'static> {
        EncodeBuf {
            sink: Sink::Sizer,
            written: 0,
        }
    }

    pub fn fixed(dst: &'a mut [u8]) -> EncodeBuf<'a> {
        EncodeBuf {
            sink: Sink::Fixed(dst),
            written: 0,
        }
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        match &mut self.sink {
            Sink::Sizer => {}
            Sink::Fixed(dst) => {
                if dst.len() < self.written + bytes.len() {
                    return Err(CodecError::BufferTooSmall);
                }
                dst[self.written..self.written + bytes.len()].copy_from_slice(bytes);
            }
        }
        self.written += bytes.len();
        Ok(())
    }

    pub fn put_fixed_int(&mut self, n: usize, value: u64) -> CodecResult<()> {
        debug_assert!((1..=8).contains(&n));
        let bytes = value.to_le_bytes();
        self.put_bytes(&bytes[..n])
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) -> CodecResult<()> {
        self.put_fixed_int(1, u64::from(v))
    }

    #[inline]
    pub fn put_u16_le(&mut self, v: u16) -> CodecResult<()> {
        self.put_fixed_int(2, u64::from(v))
    }

    #[inline]
    pub fn put_u24_le(&mut self, v: u32) -> CodecResult<()> {
        debug_assert!(v <= 0x00ff_ffff);
        self.put_fixed_int(3, u64::from(v))
    }

    #[inline]
    pub fn put_u32_le(&mut self, v: u32) -> CodecResult<()> {
        self.put_fixed_int(4, u64::from(v))
    }

    #[inline]
    pub fn put_u64_le(&mut self, v: u64) -> CodecResult<()> {
        self.put_fixed_int(8, v)
    }

    pub fn put_var_int(&mut self, v: u64) -> CodecResult<()> {
        match v {
            0..=0xfa => self.put_u8(v as u8),
            0xfb..=0xffff => {
                self.put_u8(0xfc)?;
                self.put_fixed_int(2, v)
            }
            0x1_0000..=0xff_ffff => {
                self.put_u8(0xfd)?;
                self.put_fixed_int(3, v)
            }
            _ => {
                self.put_u8(0xfe)?;
                self.put_fixed_int(8, v)
            }
        }
    }

    #[inline]
    pub fn put_null_marker(&mut self) -> CodecResult<()> {
        self.put_u8(NULL_MARKER)
    }

    pub fn put_nul_term(&mut self, bytes: &[u8]) -> CodecResult<()> {
        debug_assert!(!bytes.contains(&0));
        self.put_bytes(bytes)?;
        self.put_u8(0)
    }

    pub fn put_var_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.put_var_int(bytes.len() as u64)?;
        self.put_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_widths() {
        let mut sizer = EncodeBuf::sizer();
        sizer.put_var_int(0xfa).unwrap();
        assert_eq!(sizer.written(), 1);
        let mut sizer = EncodeBuf::sizer();
        sizer.put_var_int(0xfb).unwrap();
        assert_eq!(sizer.written(), 3);
        let mut sizer = EncodeBuf::sizer();
        sizer.put_var_int(0x1_0000).unwrap();
        assert_eq!(sizer.written(), 4);
        let mut sizer = EncodeBuf::sizer();
        sizer.put_var_int(0x1_0000_0000).unwrap();
        assert_eq!(sizer.written(), 9);
    }

    #[test]
    fn var_int_round_trip() {
        for v in [0u64, 1, 0xfa, 0xfb, 0xffff, 0x1_0000, 0xff_ffff, u64::MAX] {
            let mut out = [0u8; 9];
            let mut enc = EncodeBuf::fixed(&mut out);
            enc.put_var_int(v).unwrap();
            let written = enc.written();
            let mut dec = DecodeBuf::new(&out[..written]);
            assert_eq!(dec.var_int().unwrap(), v);
            assert_eq!(dec.consumed(), written);
        }
    }

    #[test]
    fn var_int_null_and_reserved() {
        let mut dec = DecodeBuf::new(&[0xfb]);
        assert_eq!(dec.var_int_or_null().unwrap(), None);
        let mut dec = DecodeBuf::new(&[0xfb]);
        assert_eq!(dec.var_int().unwrap_err(), CodecError::InvalidInput);
        let mut dec = DecodeBuf::new(&[0xff]);
        assert_eq!(dec.var_int().unwrap_err(), CodecError::InvalidInput);
    }

    #[test]
    fn short_reads() {
        let mut dec = DecodeBuf::new(&[0xfc, 0x01]);
        assert_eq!(dec.var_int().unwrap_err(), CodecError::NotEnoughInput);
        let mut dec = DecodeBuf::new(&[0x01, 0x02]);
        assert_eq!(dec.u32_le().unwrap_err(), CodecError::NotEnoughInput);
        let mut dec = DecodeBuf::new(b"abc");
        assert_eq!(
            dec.nul_term_bytes().unwrap_err(),
            CodecError::NotEnoughInput
        );
    }

    #[test]
    fn fixed_buffer_overflow() {
        let mut out = [0u8; 2];
        let mut enc = EncodeBuf::fixed(&mut out);
        assert_eq!(
            enc.put_u32_le(1).unwrap_err(),
            CodecError::BufferTooSmall
        );
    }

    #[test]
    fn nul_term_round_trip() {
        let mut out = [0u8; 8];
        let mut enc = EncodeBuf::fixed(&mut out);
        enc.put_nul_term(b"abc").unwrap();
        assert_eq!(&out[..4], b"abc\0");
        let mut dec = DecodeBuf::new(&out[..4]);
        assert_eq!(dec.nul_term_bytes().unwrap(), b"abc");
        assert!(dec.is_empty());
    }
}
