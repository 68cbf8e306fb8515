//! SSH wire-format buffer (RFC 4251 Section 5).
//!
//! A [`Buffer`] is a contiguous byte region with independent read and write
//! cursors. Writes append at the end and grow the buffer; reads advance the
//! read cursor and fail with a buffer error once they would pass the write
//! cursor. On top of the cursors it offers strongly-typed accessors for every
//! SSH wire type:
//!
//! - `byte`, `boolean`, `uint32` (big-endian)
//! - `string` (uint32 length prefix + bytes)
//! - `name-list` (a `string` of comma-joined names)
//! - `mpint` (big-endian two's-complement with a uint32 length prefix)
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_u32(42).put_string(b"ssh-userauth");
//!
//! assert_eq!(buf.get_u32().unwrap(), 42);
//! assert_eq!(buf.get_string().unwrap(), b"ssh-userauth");
//! ```

use crate::ssh::message::Message;
use bytes::BufMut;
use num_bigint::{BigInt, Sign};
use skiff_platform::{Error, Result};

/// Default upper bound on the length prefix of strings and name-lists.
///
/// Anything larger is treated as a protocol violation rather than an
/// allocation request.
pub const MAX_STRING_LEN: usize = 256 * 1024;

/// Number of bytes reserved in front of a packet payload for the
/// `packet_length` and `padding_length` fields.
pub const HEADER_RESERVE: usize = 5;

/// Mutable byte buffer with SSH wire-type accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            rpos: 0,
        }
    }

    /// Creates an empty buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            rpos: 0,
        }
    }

    /// Wraps an existing byte vector; the read cursor starts at 0.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, rpos: 0 }
    }

    /// Opens a buffer whose first byte is the given message type.
    ///
    /// The read cursor is at 0 and the write cursor at 1.
    pub fn new_msg(msg: Message) -> Self {
        Self {
            data: vec![msg as u8],
            rpos: 0,
        }
    }

    /// Creates a buffer with [`HEADER_RESERVE`] leading bytes reserved, so
    /// the packet encoder can prepend the packet header without copying.
    ///
    /// Both cursors start just past the reserved region.
    pub fn reserved() -> Self {
        Self {
            data: vec![0u8; HEADER_RESERVE],
            rpos: HEADER_RESERVE,
        }
    }

    /// [`Buffer::reserved`] followed by the message-type byte: the usual way
    /// to start an outbound packet.
    pub fn packet(msg: Message) -> Self {
        let mut buf = Self::reserved();
        buf.put_u8(msg as u8);
        buf
    }

    /// Returns the read cursor position.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Moves the read cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Buffer`] if the position lies past the write cursor.
    pub fn set_rpos(&mut self, rpos: usize) -> Result<()> {
        if rpos > self.data.len() {
            return Err(Error::Buffer(format!(
                "read position {} past write position {}",
                rpos,
                self.data.len()
            )));
        }
        self.rpos = rpos;
        Ok(())
    }

    /// Returns the write cursor position.
    pub fn wpos(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of unread bytes.
    pub fn available(&self) -> usize {
        self.data.len() - self.rpos
    }

    /// Returns the unread bytes without consuming them.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.rpos..]
    }

    /// Returns a copy of the bytes between the read and write cursors.
    pub fn compact_data(&self) -> Vec<u8> {
        self.data[self.rpos..].to_vec()
    }

    /// Consumes the buffer, returning the underlying bytes (including any
    /// already-read prefix).
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn ensure(&self, wanted: usize) -> Result<()> {
        if self.available() < wanted {
            return Err(Error::Buffer(format!(
                "underflow: needed {} bytes, {} available",
                wanted,
                self.available()
            )));
        }
        Ok(())
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    /// Appends a boolean as a single byte (0 or 1).
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.data.put_u8(u8::from(value));
        self
    }

    /// Appends a big-endian `uint32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32(value);
        self
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_slice(bytes);
        self
    }

    /// Appends a length-prefixed `string`.
    pub fn put_string(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.put_u32(bytes.len() as u32);
        self.data.put_slice(bytes);
        self
    }

    /// Appends a `name-list`: the names comma-joined as a `string`.
    pub fn put_name_list(&mut self, names: &[String]) -> &mut Self {
        self.put_string(names.join(",").as_bytes())
    }

    /// Appends an `mpint`.
    ///
    /// Zero encodes as a length of zero followed by no bytes. Negative values
    /// and values with the high bit set get the sign byte two's-complement
    /// encoding requires.
    pub fn put_mpint(&mut self, value: &BigInt) -> &mut Self {
        if value.sign() == Sign::NoSign {
            self.data.put_u32(0);
            return self;
        }
        let bytes = value.to_signed_bytes_be();
        self.put_string(&bytes)
    }

    /// Reads a single byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let value = self.data[self.rpos];
        self.rpos += 1;
        Ok(value)
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let bytes = [
            self.data[self.rpos],
            self.data[self.rpos + 1],
            self.data[self.rpos + 2],
            self.data[self.rpos + 3],
        ];
        self.rpos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Reads `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure(len)?;
        let bytes = self.data[self.rpos..self.rpos + len].to_vec();
        self.rpos += len;
        Ok(bytes)
    }

    /// Reads a length-prefixed `string`, bounded by [`MAX_STRING_LEN`].
    pub fn get_string(&mut self) -> Result<Vec<u8>> {
        self.get_string_max(MAX_STRING_LEN)
    }

    /// Reads a length-prefixed `string` with a caller-chosen bound.
    pub fn get_string_max(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(Error::Buffer(format!(
                "string length {} exceeds limit {}",
                len, max
            )));
        }
        self.get_raw(len)
    }

    /// Reads a `string` and interprets it as UTF-8.
    pub fn get_string_utf8(&mut self) -> Result<String> {
        let bytes = self.get_string()?;
        String::from_utf8(bytes).map_err(|_| Error::Buffer("string is not valid UTF-8".to_string()))
    }

    /// Reads a `name-list` and splits it on commas.
    pub fn get_name_list(&mut self) -> Result<Vec<String>> {
        let joined = self.get_string_utf8()?;
        if joined.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(joined.split(',').map(String::from).collect())
        }
    }

    /// Reads an `mpint`.
    pub fn get_mpint(&mut self) -> Result<BigInt> {
        let bytes = self.get_string()?;
        if bytes.is_empty() {
            Ok(BigInt::from(0u8))
        } else {
            Ok(BigInt::from_signed_bytes_be(&bytes))
        }
    }
}
