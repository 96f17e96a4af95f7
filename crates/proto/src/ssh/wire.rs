//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writers append to a [`BytesMut`]; [`WireReader`] walks a borrowed payload
//! and reports truncation or malformed fields as protocol errors.

use bytes::{BufMut, BytesMut};
use halyard_platform::{HalyardError, HalyardResult};

/// Appends a `string` (u32 length + bytes).
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Appends a UTF-8 `string`.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Appends a `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a comma separated `name-list`.
pub fn write_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    write_string(buf, &joined);
}

/// Appends a non-negative `mpint` given its unsigned big-endian magnitude.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the
/// high bit is set; zero encodes as an empty string.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Returns the `mpint` encoding (length prefix included) of an unsigned magnitude.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];
    let pad = trimmed.first().map_or(false, |&b| b & 0x80 != 0);

    let len = trimmed.len() + usize::from(pad);
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Cursor over an SSH encoded payload.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Whether everything has been consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize, what: &str) -> HalyardResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                HalyardError::Protocol(format!(
                    "Truncated {} at offset {}: need {} bytes, have {}",
                    what,
                    self.offset,
                    len,
                    self.data.len() - self.offset
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> HalyardResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a `boolean` (any non-zero value is true).
    pub fn read_bool(&mut self) -> HalyardResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> HalyardResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> HalyardResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a `string` as raw bytes.
    pub fn read_bytes(&mut self) -> HalyardResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_string(&mut self) -> HalyardResult<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| HalyardError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a `name-list`; an empty string yields an empty list.
    pub fn read_name_list(&mut self) -> HalyardResult<Vec<String>> {
        let list = self.read_string()?;
        if list.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(list.split(',').map(String::from).collect())
        }
    }

    /// Reads an `mpint` and returns its unsigned magnitude.
    ///
    /// Negative values are rejected.
    pub fn read_mpint(&mut self) -> HalyardResult<&'a [u8]> {
        let bytes = self.read_bytes()?;
        if bytes.first().map_or(false, |&b| b & 0x80 != 0) {
            return Err(HalyardError::Protocol("Negative mpint".to_string()));
        }
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpint_encoding_rfc_examples() {
        // RFC 4251 Section 5 examples
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0, 0]), vec![0, 0, 0, 0]);
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
        assert_eq!(encode_mpint(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
    }

    #[test]
    fn test_read_mpint_strips_sign_byte() {
        let encoded = encode_mpint(&[0x80, 0x01]);
        let mut reader = WireReader::new(&encoded);
        assert_eq!(reader.read_mpint().unwrap(), &[0x80, 0x01]);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let data = [0, 0, 0, 1, 0xff];
        let mut reader = WireReader::new(&data);
        assert!(matches!(
            reader.read_mpint(),
            Err(HalyardError::Protocol(_))
        ));
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &["zlib", "none"]);
        write_name_list::<&str>(&mut buf, &[]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_name_list().unwrap(), vec!["zlib", "none"]);
        assert!(reader.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_string() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut reader = WireReader::new(&data);
        let err = reader.read_bytes().unwrap_err();
        assert!(err.to_string().contains("Truncated string"));
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff];
        let mut reader = WireReader::new(&data);
        assert!(reader.read_bytes().is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [0, 0, 0, 2, 0xff, 0xfe];
        let mut reader = WireReader::new(&data);
        assert!(reader.read_string().is_err());
    }
}
