//! Bounded reading and writing of wire integers.

use byteorder::{BigEndian, ByteOrder};
use bytes::BufMut;

/// A read would pass the end of the buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ShortRead;

/// Forward-only cursor over untrusted wire bytes.
///
/// Every accessor either consumes exactly the requested bytes and returns a
/// view into the backing buffer, or fails with `ShortRead` leaving the
/// cursor where it was. Nothing is ever copied or allocated.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf }
    }

    /// Bytes left in front of the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn take_u8(&mut self) -> Result<u8, ShortRead> {
        self.take_bytes(1).map(|b| b[0])
    }

    pub fn take_u16_be(&mut self) -> Result<u16, ShortRead> {
        self.take_bytes(2).map(BigEndian::read_u16)
    }

    pub fn take_u24_be(&mut self) -> Result<u32, ShortRead> {
        self.take_bytes(3).map(BigEndian::read_u24)
    }

    pub fn take_u48_be(&mut self) -> Result<u64, ShortRead> {
        self.take_bytes(6).map(|b| BigEndian::read_uint(b, 6))
    }

    pub fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], ShortRead> {
        if self.buf.len() < n {
            return Err(ShortRead);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    /// A `u8` length followed by that many bytes; the pair is consumed
    /// together or not at all.
    pub fn take_len_prefixed_u8(&mut self) -> Result<&'a [u8], ShortRead> {
        if self.buf.is_empty() {
            return Err(ShortRead);
        }
        let len = self.buf[0] as usize;
        self.take_prefixed(1, len)
    }

    /// A big-endian `u16` length followed by that many bytes.
    pub fn take_len_prefixed_u16(&mut self) -> Result<&'a [u8], ShortRead> {
        if self.buf.len() < 2 {
            return Err(ShortRead);
        }
        let len = BigEndian::read_u16(&self.buf[..2]) as usize;
        self.take_prefixed(2, len)
    }

    pub fn advance(&mut self, n: usize) -> Result<(), ShortRead> {
        self.take_bytes(n).map(|_| ())
    }

    fn take_prefixed(&mut self, width: usize, len: usize) -> Result<&'a [u8], ShortRead> {
        if self.buf.len() < width + len {
            return Err(ShortRead);
        }
        let out = &self.buf[width..width + len];
        self.buf = &self.buf[width + len..];
        Ok(out)
    }
}

/// Odd-width big-endian writes missing from `BufMut`.
pub trait BufMutExt {
    fn put_u24_be(&mut self, x: u32);
    fn put_u48_be(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn put_u24_be(&mut self, x: u32) {
        debug_assert!(x < 1 << 24);
        let mut bytes = [0; 3];
        BigEndian::write_u24(&mut bytes, x);
        self.put_slice(&bytes);
    }

    fn put_u48_be(&mut self, x: u64) {
        debug_assert!(x < 1 << 48);
        let mut bytes = [0; 6];
        BigEndian::write_uint(&mut bytes, x, 6);
        self.put_slice(&bytes);
    }
}
