//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string; they are
//! skipped, up to [`MAX_PREAMBLE_LINES`] lines and [`MAX_PREAMBLE_BYTES`]
//! bytes.
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::version::Version;
//!
//! let version = Version::new("Halyard_0.1.0", Some("test"));
//! assert_eq!(version.to_string(), "SSH-2.0-Halyard_0.1.0 test");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use halyard_platform::{HalyardError, HalyardResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the identification string.
pub const MAX_PREAMBLE_LINES: usize = 50;

/// Maximum number of bytes accepted before the identification string.
pub const MAX_PREAMBLE_BYTES: usize = 8 * 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    /// The identification line as sent, without CR LF.
    line: String,
}

impl Version {
    /// Creates an identification string for protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let mut line = format!("SSH-2.0-{}", software);
        if let Some(comments) = comments {
            line.push(' ');
            line.push_str(comments);
        }
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// The default Halyard identification.
    pub fn default_halyard() -> Self {
        Self::new(&format!("Halyard_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> HalyardResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(HalyardError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(HalyardError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }
        if !line.starts_with("SSH-") {
            return Err(HalyardError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 || parts[2].is_empty() {
            return Err(HalyardError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(HalyardError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let rest = parts[2];
        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification line without CR LF, as hashed into `H`.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Incremental reader for the peer's identification line.
#[derive(Debug, Default)]
pub struct IdentificationReader {
    preamble_lines: usize,
    preamble_bytes: usize,
}

impl IdentificationReader {
    /// Creates a reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes complete lines from `buf` until the identification line.
    ///
    /// Returns `Ok(None)` when more input is needed. Bytes after the
    /// identification line are left in `buf`.
    pub fn read(&mut self, buf: &mut BytesMut) -> HalyardResult<Option<Version>> {
        loop {
            let newline = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if buf.len() > MAX_VERSION_LENGTH + 2
                        && self.preamble_bytes + buf.len() > MAX_PREAMBLE_BYTES
                    {
                        return Err(HalyardError::Protocol(
                            "Identification line not found within preamble limit".to_string(),
                        ));
                    }
                    return Ok(None);
                }
            };

            let line = buf.split_to(newline + 1);
            if line.starts_with(b"SSH-") {
                let text = std::str::from_utf8(&line).map_err(|_| {
                    HalyardError::Protocol("Identification line is not valid UTF-8".to_string())
                })?;
                return Version::parse(text).map(Some);
            }

            self.preamble_lines += 1;
            self.preamble_bytes += line.len();
            tracing::trace!(len = line.len(), "skipping identification preamble line");
            if self.preamble_lines > MAX_PREAMBLE_LINES || self.preamble_bytes > MAX_PREAMBLE_BYTES {
                return Err(HalyardError::Protocol(format!(
                    "Identification preamble exceeds {} lines or {} bytes",
                    MAX_PREAMBLE_LINES, MAX_PREAMBLE_BYTES
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Halyard_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Halyard_0.1.0");
        assert_eq!(version.comments(), None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Halyard_0.1.0\r\n");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
        assert_eq!(version.as_str(), "SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1");
    }

    #[test]
    fn test_version_parse_accepts_1_99() {
        assert_eq!(Version::parse("SSH-1.99-Legacy").unwrap().proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(HalyardError::Protocol(_))
        ));
        match Version::parse("SSH-1.0-OldClient") {
            Err(HalyardError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
        assert!(Version::parse(&format!("SSH-2.0-{}", "A".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_reader_skips_preamble() {
        let mut reader = IdentificationReader::new();
        let mut buf = BytesMut::from(&b"Welcome\r\nsecond line\r\nSSH-2.0-Peer_1.0\r\n\x00\x00"[..]);
        let version = reader.read(&mut buf).unwrap().unwrap();
        assert_eq!(version.software(), "Peer_1.0");
        assert_eq!(&buf[..], b"\x00\x00");
    }

    #[test]
    fn test_reader_waits_for_line() {
        let mut reader = IdentificationReader::new();
        let mut buf = BytesMut::from(&b"SSH-2.0-Pe"[..]);
        assert!(reader.read(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"er\n");
        assert_eq!(reader.read(&mut buf).unwrap().unwrap().software(), "Peer");
    }

    #[test]
    fn test_reader_preamble_limit() {
        let mut reader = IdentificationReader::new();
        let mut buf = BytesMut::new();
        for _ in 0..=MAX_PREAMBLE_LINES {
            buf.extend_from_slice(b"noise\r\n");
        }
        buf.extend_from_slice(b"SSH-2.0-Late\r\n");
        assert!(reader.read(&mut buf).is_err());
    }
}
