//! Little-endian helpers shared by the index and block formats

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

pub(crate) fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        out.put_u64_le(*v);
    }
}

pub(crate) fn put_u32s(out: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        out.put_u32_le(*v);
    }
}

pub(crate) fn put_u16s(out: &mut Vec<u8>, values: &[u16]) {
    for v in values {
        out.put_u16_le(*v);
    }
}

/// Bounds-checked cursor; every short read is `InvalidArgument`
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.remaining() < bytes {
            return Err(Error::invalid(format!(
                "truncated {}: need {} more bytes, have {}",
                self.what,
                bytes,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn magic(&mut self, expected: &[u8; 4]) -> Result<()> {
        self.need(4)?;
        let found = &self.buf[..4];
        if found != expected {
            return Err(Error::invalid(format!(
                "bad {} magic: {:?}",
                self.what,
                String::from_utf8_lossy(found)
            )));
        }
        self.buf.advance(4);
        Ok(())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Element count read from a header, checked against the remaining bytes
    pub(crate) fn count(&mut self, element_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        self.need(n.saturating_mul(element_size))?;
        Ok(n)
    }

    pub(crate) fn u64s(&mut self, n: usize) -> Result<Vec<u64>> {
        self.need(n.saturating_mul(8))?;
        Ok((0..n).map(|_| self.buf.get_u64_le()).collect())
    }

    pub(crate) fn u32s(&mut self, n: usize) -> Result<Vec<u32>> {
        self.need(n.saturating_mul(4))?;
        Ok((0..n).map(|_| self.buf.get_u32_le()).collect())
    }

    pub(crate) fn u16s(&mut self, n: usize) -> Result<Vec<u16>> {
        self.need(n.saturating_mul(2))?;
        Ok((0..n).map(|_| self.buf.get_u16_le()).collect())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Fail unless the whole buffer was consumed
    pub(crate) fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::invalid(format!(
                "{} has {} trailing bytes",
                self.what,
                self.buf.len()
            )));
        }
        Ok(())
    }
}
