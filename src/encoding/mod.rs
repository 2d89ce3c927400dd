//! Bounds-checked little-endian decoding primitives.
//!
//! Every on-disk structure in this crate (WAL records, SST blocks and
//! footers, the manifest snapshot) is a hand-written little-endian
//! layout. Writing is done with [`bytes::BufMut`] directly — appending
//! to a `Vec<u8>` cannot fail. Reading, however, happens on bytes that
//! may be truncated or corrupted, so every read must be bounds-checked
//! and must surface a typed error instead of panicking.
//!
//! [`ByteReader`] is that checked cursor: it walks a borrowed slice,
//! yields fixed-width integers and length-prefixed byte runs, and
//! reports [`EncodingError::UnexpectedEof`] the moment a field would
//! run past the end of the buffer. Decoders for composite structures
//! advance a single reader field by field, so a corrupt length prefix
//! is detected exactly at the field that carries it.
//!
//! All multi-byte integers are little-endian.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Errors produced while decoding on-disk bytes.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before the field completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A decoded length field is inconsistent with its container.
    #[error("length mismatch: {0}")]
    LengthMismatch(String),
}

/// A bounds-checked forward cursor over a byte slice.
///
/// Reads never panic; any attempt to read past the end of the slice
/// returns [`EncodingError::UnexpectedEof`].
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset from the start of the underlying slice.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when the cursor has consumed the whole slice.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, EncodingError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, EncodingError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, EncodingError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        self.take(len)
    }

    /// Reads `[u16 len][bytes]`.
    pub fn read_len_u16(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Reads `[u32 len][bytes]`.
    pub fn read_len_u32(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}
