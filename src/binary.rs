//! Big-endian field reader/writer shared by the header and BlocksInfo codecs.
//!
//! Every read names the field it is decoding so a short input surfaces as
//! [`FormatError::Truncated`] with the field name and absolute offset.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BundleError, Result};

const PREALLOC_LIMIT: usize = 1 << 20;

/// Tracks the absolute position of an underlying reader.
pub struct FieldReader<R> {
    inner: R,
    pos:   u64,
}

impl<R: Read> FieldReader<R> {
    pub fn new(inner: R, pos: u64) -> Self {
        Self { inner, pos }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fixed<T>(
        &mut self,
        field: &'static str,
        width: u64,
        read: impl FnOnce(&mut R) -> io::Result<T>,
    ) -> Result<T> {
        let at = self.pos;
        let value = read(&mut self.inner).map_err(|e| BundleError::truncated_or_io(e, field, at))?;
        self.pos += width;
        Ok(value)
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16> {
        self.fixed(field, 2, |r| r.read_u16::<BigEndian>())
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.fixed(field, 4, |r| r.read_u32::<BigEndian>())
    }

    pub fn i32(&mut self, field: &'static str) -> Result<i32> {
        self.fixed(field, 4, |r| r.read_i32::<BigEndian>())
    }

    pub fn i64(&mut self, field: &'static str) -> Result<i64> {
        self.fixed(field, 8, |r| r.read_i64::<BigEndian>())
    }

    pub fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        self.fixed(field, N as u64, |r| {
            let mut buf = [0u8; N];
            r.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    /// `len` comes from the input, so the buffer grows with what is actually
    /// read instead of being allocated up front.
    pub fn bytes(&mut self, field: &'static str, len: usize) -> Result<Vec<u8>> {
        self.fixed(field, len as u64, |r| {
            let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT));
            r.by_ref().take(len as u64).read_to_end(&mut buf)?;
            if buf.len() < len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            Ok(buf)
        })
    }

    /// Read bytes up to (and consuming) a NUL terminator.  Non-UTF-8 bytes
    /// are replaced; paths and version strings are ASCII in practice.
    pub fn cstring(&mut self, field: &'static str) -> Result<String> {
        let start = self.pos;
        let mut buf = Vec::new();
        loop {
            let b = self
                .inner
                .read_u8()
                .map_err(|e| BundleError::truncated_or_io(e, field, start))?;
            self.pos += 1;
            if b == 0 {
                break;
            }
            buf.push(b);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Write `s` followed by a NUL terminator.
pub fn write_cstring<W: Write>(mut writer: W, s: &str) -> io::Result<()> {
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)
}

/// Number of padding bytes that bring `pos` up to a multiple of `align`.
#[inline]
pub fn padding_for(pos: u64, align: u64) -> u64 {
    (align - pos % align) % align
}
