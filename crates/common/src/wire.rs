//! Field-at-a-time binary encoding for relay messages
//!
//! All integers are little-endian. Strings are a u32 byte length followed by
//! UTF-8 bytes, capped at [`MAX_WIRE_STRING_BYTES`] on both the encode and
//! decode side. Optional fields carry a one-byte tag (0 = absent, 1 = present).
//! File descriptors never appear in the byte stream itself; the encoder keeps
//! them in a side table and fields reference them by index.
//!
//! Decoding is all-or-nothing: any failed field aborts the whole message and
//! the caller must discard it. A [`Decoder`] never hands out partial values.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::constants::MAX_WIRE_STRING_BYTES;

/// Errors produced while decoding a message payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer truncated at offset {offset}: {needed} more byte(s) required")]
    Truncated { offset: usize, needed: usize },

    #[error("string field is not valid UTF-8")]
    BadString,

    #[error("string length {len} exceeds limit of {limit} bytes")]
    StringTooLong { len: usize, limit: usize },

    #[error("invalid option tag {0:#04x}")]
    BadTag(u8),

    #[error("unknown {what} discriminant: {value}")]
    BadDiscriminant { what: &'static str, value: u32 },

    #[error("attachment index {index} not available ({count} attached)")]
    BadAttachment { index: u32, count: usize },

    #[error("{0} trailing byte(s) after message payload")]
    TrailingBytes(usize),

    #[error("{0} attachment(s) left unclaimed by message payload")]
    UnclaimedAttachments(usize),
}

/// Errors produced while encoding a message payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("string length {len} exceeds limit of {limit} bytes")]
    StringTooLong { len: usize, limit: usize },
}

/// Serializes message fields into a payload buffer plus attachment table
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn check_str_len(value: &str) -> Result<(), EncodeError> {
        if value.len() > MAX_WIRE_STRING_BYTES {
            return Err(EncodeError::StringTooLong {
                len: value.len(),
                limit: MAX_WIRE_STRING_BYTES,
            });
        }
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string
    ///
    /// Oversized values fail here, before anything reaches the wire, rather
    /// than at the peer's decoder. A failed put leaves the buffer untouched.
    pub fn put_str(&mut self, value: &str) -> Result<(), EncodeError> {
        Self::check_str_len(value)?;
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write an optional string as tag byte + string
    pub fn put_opt_str(&mut self, value: Option<&str>) -> Result<(), EncodeError> {
        match value {
            Some(s) => {
                Self::check_str_len(s)?;
                self.put_bool(true);
                self.put_str(s)
            }
            None => {
                self.put_bool(false);
                Ok(())
            }
        }
    }

    /// Write a length-prefixed byte blob
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Move a file descriptor into the attachment table, returning its index
    pub fn attach_fd(&mut self, fd: OwnedFd) -> u32 {
        self.fds.push(fd);
        (self.fds.len() - 1) as u32
    }

    pub fn attachment_count(&self) -> usize {
        self.fds.len()
    }

    /// Consume the encoder, yielding the payload and its attachments
    pub fn finish(self) -> (Vec<u8>, Vec<OwnedFd>) {
        (self.buf, self.fds)
    }
}

/// Reads message fields back out of a payload buffer
///
/// Attachments are claimed by index via [`Decoder::take_fd`], and
/// [`Decoder::finish`] fails if any are left unclaimed, so a stray descriptor
/// fails the whole decode instead of being silently closed.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    fds: Vec<Option<OwnedFd>>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], fds: Vec<OwnedFd>) -> Self {
        Self {
            buf,
            pos: 0,
            fds: fds.into_iter().map(Some).collect(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n - available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        let mut arr = [0u8; 2];
        arr.copy_from_slice(bytes);
        Ok(u16::from_le_bytes(arr))
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(arr))
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::BadTag(tag)),
        }
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_str(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u32()? as usize;
        if len > MAX_WIRE_STRING_BYTES {
            return Err(DecodeError::StringTooLong {
                len,
                limit: MAX_WIRE_STRING_BYTES,
            });
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadString)
    }

    /// Read an optional string written by [`Encoder::put_opt_str`]
    pub fn get_opt_str(&mut self) -> Result<Option<String>, DecodeError> {
        if self.get_bool()? {
            Ok(Some(self.get_str()?))
        } else {
            Ok(None)
        }
    }

    /// Read a length-prefixed byte blob
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Claim ownership of the attachment at `index`
    ///
    /// Each attachment can be taken exactly once.
    pub fn take_fd(&mut self, index: u32) -> Result<OwnedFd, DecodeError> {
        let count = self.fds.len();
        self.fds
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(DecodeError::BadAttachment { index, count })
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Assert the payload and attachment table were fully consumed
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes(self.remaining()));
        }
        let unclaimed = self.fds.iter().filter(|fd| fd.is_some()).count();
        if unclaimed != 0 {
            return Err(DecodeError::UnclaimedAttachments(unclaimed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fd() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    #[test]
    fn test_scalar_roundtrip() {
        let mut enc = Encoder::new();
        enc.put_u8(0xab);
        enc.put_u16(0xbeef);
        enc.put_u32(0xdead_beef);
        enc.put_u64(u64::MAX - 1);
        enc.put_bool(true);
        let (buf, fds) = enc.finish();
        assert!(fds.is_empty());

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(dec.get_u8().unwrap(), 0xab);
        assert_eq!(dec.get_u16().unwrap(), 0xbeef);
        assert_eq!(dec.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(dec.get_u64().unwrap(), u64::MAX - 1);
        assert!(dec.get_bool().unwrap());
        dec.finish().unwrap();
    }

    #[test]
    fn test_string_roundtrip() {
        let mut enc = Encoder::new();
        enc.put_str("hello").unwrap();
        enc.put_opt_str(Some("wörld")).unwrap();
        enc.put_opt_str(None).unwrap();
        enc.put_bytes(b"\x00\x01\x02");
        let (buf, _) = enc.finish();

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(dec.get_str().unwrap(), "hello");
        assert_eq!(dec.get_opt_str().unwrap().as_deref(), Some("wörld"));
        assert_eq!(dec.get_opt_str().unwrap(), None);
        assert_eq!(dec.get_bytes().unwrap(), b"\x00\x01\x02");
        dec.finish().unwrap();
    }

    #[test]
    fn test_truncated_field_reports_offset() {
        let mut enc = Encoder::new();
        enc.put_u32(7);
        let (buf, _) = enc.finish();

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(dec.get_u32().unwrap(), 7);
        assert_eq!(
            dec.get_u64(),
            Err(DecodeError::Truncated {
                offset: 4,
                needed: 8
            })
        );
    }

    #[test]
    fn test_truncated_string_body() {
        // Claims 10 bytes of string data but carries only 3
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");

        let mut dec = Decoder::new(&buf, Vec::new());
        assert!(matches!(
            dec.get_str(),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = 2u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xfe]);

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(dec.get_str(), Err(DecodeError::BadString));
    }

    #[test]
    fn test_oversized_string_rejected_before_read() {
        let buf = ((MAX_WIRE_STRING_BYTES + 1) as u32).to_le_bytes().to_vec();

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(
            dec.get_str(),
            Err(DecodeError::StringTooLong {
                len: MAX_WIRE_STRING_BYTES + 1,
                limit: MAX_WIRE_STRING_BYTES,
            })
        );
    }

    #[test]
    fn test_oversized_string_rejected_at_encode() {
        let long = "x".repeat(MAX_WIRE_STRING_BYTES + 1);
        let mut enc = Encoder::new();
        assert_eq!(
            enc.put_str(&long),
            Err(EncodeError::StringTooLong {
                len: MAX_WIRE_STRING_BYTES + 1,
                limit: MAX_WIRE_STRING_BYTES,
            })
        );
        assert!(enc.put_opt_str(Some(&long)).is_err());
        assert!(enc.buf.is_empty(), "failed puts must not write");
        assert!(enc.put_str("still fine").is_ok());
    }

    #[test]
    fn test_bad_option_tag() {
        let mut dec = Decoder::new(&[2u8], Vec::new());
        assert_eq!(dec.get_opt_str(), Err(DecodeError::BadTag(2)));
    }

    #[test]
    fn test_trailing_bytes_flagged() {
        let mut enc = Encoder::new();
        enc.put_u32(1);
        enc.put_u8(9);
        let (buf, _) = enc.finish();

        let mut dec = Decoder::new(&buf, Vec::new());
        assert_eq!(dec.get_u32().unwrap(), 1);
        assert_eq!(dec.finish(), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_fd_attachment_taken_once() {
        let mut enc = Encoder::new();
        let index = enc.attach_fd(dummy_fd());
        enc.put_u32(index);
        assert_eq!(enc.attachment_count(), 1);
        let (buf, fds) = enc.finish();
        assert_eq!(fds.len(), 1);

        let mut dec = Decoder::new(&buf, fds);
        let index = dec.get_u32().unwrap();
        assert!(dec.take_fd(index).is_ok());
        assert!(matches!(
            dec.take_fd(index),
            Err(DecodeError::BadAttachment { index: 0, count: 1 })
        ));
    }

    #[test]
    fn test_fd_index_out_of_range() {
        let mut dec = Decoder::new(&[], Vec::new());
        assert!(matches!(
            dec.take_fd(3),
            Err(DecodeError::BadAttachment { index: 3, count: 0 })
        ));
    }

    #[test]
    fn test_unclaimed_attachment_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32(7);
        enc.attach_fd(dummy_fd());
        let (buf, fds) = enc.finish();

        let mut dec = Decoder::new(&buf, fds);
        assert_eq!(dec.get_u32().unwrap(), 7);
        assert_eq!(dec.finish(), Err(DecodeError::UnclaimedAttachments(1)));
    }
}
