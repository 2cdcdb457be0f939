//! Little-endian binary reader and writer for module images
//!
//! Module files and their debug blocks are packed little-endian structures
//! with NUL-terminated names in between, so the reader works on byte offsets
//! rather than record indices.

use thiserror::Error;

/// Errors that can occur while decoding a module image or debug block
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    /// Name is not valid UTF-8
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Magic number does not match
    #[error("Bad magic {found:#06x} (expected {expected:#06x})")]
    BadMagic {
        /// Magic that was found
        found: u16,
        /// Magic that was expected
        expected: u16,
    },

    /// A header field points outside the data
    #[error("Invalid {field} offset {offset}")]
    InvalidOffset {
        /// Header field name
        field: &'static str,
        /// Offending value
        offset: i64,
    },
}

// ============================================================================
// ByteWriter
// ============================================================================

/// Writer for building module images and debug blocks
#[derive(Debug, Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Get the bytes written so far
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current offset (number of bytes written)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Emit a single byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 16-bit signed integer
    pub fn emit_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a NUL-terminated string
    pub fn emit_cstr(&mut self, value: &str) {
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Overwrite a previously emitted 32-bit value at `offset`
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

// ============================================================================
// ByteReader
// ============================================================================

/// Reader over a module image or debug block
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Create a new reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Remaining bytes
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Seek to an absolute position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self
            .position
            .checked_add(N)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buffer[self.position..end]);
        self.position = end;
        Ok(bytes)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    /// Read a 16-bit unsigned integer
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// Read a 16-bit signed integer
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    /// Read a 32-bit unsigned integer
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// Read a 32-bit signed integer
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    /// Read a NUL-terminated string
    pub fn read_cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.position;
        let rest = self
            .buffer
            .get(start..)
            .ok_or(DecodeError::UnexpectedEnd(start))?;
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::UnexpectedEnd(start))?;
        let value = std::str::from_utf8(&rest[..len])
            .map_err(|_| DecodeError::InvalidUtf8(start))?
            .to_string();
        self.position = start + len + 1;
        Ok(value)
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}
