// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Low-level wire primitives for the archive format.
//!
//! Every token is a length-prefixed byte string: a little-endian `u64`
//! length, the bytes, then zero padding up to the next 8-byte boundary.

use std::io::{self, Read, Write};

use crate::NarError;

pub const MAGIC: &[u8] = b"nix-archive-1";

/// Upper bound for structural strings (entry names, symlink targets,
/// token keywords). File contents are not subject to this limit.
pub const MAX_STRING_LEN: u64 = 4096;

pub const fn padding_len(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

pub fn write_u64<W: Write + ?Sized>(w: &mut W, value: u64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub fn write_bytes<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    w.write_all(&[0u8; 8][..padding_len(bytes.len() as u64)])
}

pub fn write_token<W: Write + ?Sized>(w: &mut W, token: &str) -> io::Result<()> {
    write_bytes(w, token.as_bytes())
}

/// A reader wrapper that tracks the absolute offset of the next byte.
pub struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        CountingReader { inner, pos: 0 }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a bounded byte string plus its padding.
    pub fn read_bytes(&mut self, limit: u64) -> Result<Vec<u8>, NarError> {
        let offset = self.pos();
        let len = self.read_u64()?;
        if len > limit {
            return Err(NarError::StringTooLong { offset, length: len });
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        self.read_padding(len)?;
        Ok(buf)
    }

    pub fn read_padding(&mut self, len: u64) -> Result<(), NarError> {
        let pad = padding_len(len);
        if pad > 0 {
            let offset = self.pos();
            let mut buf = [0u8; 8];
            self.read_exact(&mut buf[..pad])?;
            if buf[..pad].iter().any(|&b| b != 0) {
                return Err(NarError::BadPadding(offset));
            }
        }
        Ok(())
    }

    /// Read a token and require it to equal `expected`.
    pub fn expect_token(&mut self, expected: &'static str) -> Result<(), NarError> {
        let offset = self.pos();
        let got = self.read_bytes(MAX_STRING_LEN)?;
        if got != expected.as_bytes() {
            return Err(NarError::UnexpectedToken { offset, expected });
        }
        Ok(())
    }

    /// Read exactly `len` content bytes in chunks, passing each chunk to
    /// `each`. The trailing padding is consumed and validated.
    pub fn read_content(
        &mut self,
        len: u64,
        mut each: impl FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<(), NarError> {
        let mut remaining = len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.read_exact(&mut buf[..n])?;
            each(&buf[..n])?;
            remaining -= n as u64;
        }
        self.read_padding(len)
    }
}
