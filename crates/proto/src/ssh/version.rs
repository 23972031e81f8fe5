//! SSH protocol version exchange (RFC 4253 section 4.2).
//!
//! Each side sends an identification string before the binary packet
//! protocol starts:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may precede its identification with other lines of text; those
//! are collected and surfaced but otherwise ignored.

use std::fmt;

use kedge_platform::{KedgeError, KedgeResult};

/// Maximum length of the identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum bytes of prelude text tolerated before the identification line.
pub const MAX_PRELUDE_LENGTH: usize = 8 * 1024;

/// A parsed SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version, always "2.0" for supported peers.
    pub protocol: String,
    /// Software name and version.
    pub software: String,
    /// Optional comment after the first space.
    pub comments: Option<String>,
}

impl Version {
    /// Builds the local identification for this crate.
    pub fn local() -> Self {
        Self {
            protocol: "2.0".to_string(),
            software: format!("kedge_{}", kedge_platform::VERSION),
            comments: None,
        }
    }

    /// Parses an identification line without its CR LF terminator.
    pub fn parse(line: &str) -> KedgeResult<Self> {
        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            KedgeError::Frame(format!("invalid version line: {line:?}"))
        })?;
        let (ident, comments) = match rest.split_once(' ') {
            Some((ident, comments)) => (ident, Some(comments.to_string())),
            None => (rest, None),
        };
        let (protocol, software) = ident.split_once('-').ok_or_else(|| {
            KedgeError::Frame(format!("invalid version line: {line:?}"))
        })?;
        if software.is_empty() {
            return Err(KedgeError::Frame(format!(
                "empty software version: {line:?}"
            )));
        }
        if protocol != "2.0" && protocol != "1.99" {
            return Err(KedgeError::Frame(format!(
                "unsupported protocol version {protocol}"
            )));
        }
        Ok(Self {
            protocol: protocol.to_string(),
            software: software.to_string(),
            comments,
        })
    }

    /// The full line as sent on the wire, CR LF included.
    pub fn to_wire(&self) -> Vec<u8> {
        format!("{self}\r\n").into_bytes()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SSH-{}-{}", self.protocol, self.software)?;
        if let Some(comments) = &self.comments {
            write!(f, " {comments}")?;
        }
        Ok(())
    }
}

/// Outcome of feeding bytes to a [`VersionReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionProgress {
    /// More bytes are needed.
    Incomplete,
    /// The peer's identification was read; `consumed` bytes of the input
    /// belong to the version exchange, the rest is packet data.
    Done {
        /// Parsed peer identification.
        version: Version,
        /// The raw line without CR LF, needed for the exchange hash.
        raw_line: String,
        /// Non-identification lines received before the SSH line.
        prelude: Vec<String>,
        /// Bytes of input consumed by the exchange.
        consumed: usize,
    },
}

/// Incremental reader for the peer's identification string.
///
/// Tolerates arbitrary chunk boundaries: bytes may arrive one at a time or
/// with packet data glued after the CR LF.
#[derive(Debug, Default)]
pub struct VersionReader {
    line: Vec<u8>,
    prelude: Vec<String>,
    prelude_bytes: usize,
}

impl VersionReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes bytes from `data`, returning progress. On `Done`, only
    /// `consumed` bytes were used; the caller owns the remainder.
    pub fn feed(&mut self, data: &[u8]) -> KedgeResult<VersionProgress> {
        let mut used = 0;
        for &byte in data {
            used += 1;
            if byte == b'\n' {
                // Tolerate bare LF line endings from preludes.
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                let line = std::mem::take(&mut self.line);
                if line.starts_with(b"SSH-") {
                    let text = String::from_utf8(line).map_err(|_| {
                        KedgeError::Frame("version line is not UTF-8".to_string())
                    })?;
                    let version = Version::parse(&text)?;
                    return Ok(VersionProgress::Done {
                        version,
                        raw_line: text,
                        prelude: std::mem::take(&mut self.prelude),
                        consumed: used,
                    });
                }
                self.prelude_bytes += line.len();
                if self.prelude_bytes > MAX_PRELUDE_LENGTH {
                    return Err(KedgeError::Frame(
                        "version exchange prelude too long".to_string(),
                    ));
                }
                self.prelude
                    .push(String::from_utf8_lossy(&line).into_owned());
            } else {
                self.line.push(byte);
                if self.line.len() > MAX_VERSION_LENGTH {
                    if self.line.starts_with(b"SSH-") {
                        return Err(KedgeError::Frame(
                            "version line exceeds 255 bytes".to_string(),
                        ));
                    }
                    if self.line.len() + self.prelude_bytes > MAX_PRELUDE_LENGTH {
                        return Err(KedgeError::Frame(
                            "version exchange prelude too long".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(VersionProgress::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let v = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
        assert_eq!(v.protocol, "2.0");
        assert_eq!(v.software, "OpenSSH_9.6");
        assert_eq!(v.comments, None);
    }

    #[test]
    fn test_parse_version_with_comments() {
        let v = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13").unwrap();
        assert_eq!(v.comments.as_deref(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-1.5-old").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let v = Version::local();
        let again = Version::parse(&v.to_string()).unwrap();
        assert_eq!(v, again);
    }

    #[test]
    fn test_reader_whole_line() {
        let mut reader = VersionReader::new();
        match reader.feed(b"SSH-2.0-test\r\n").unwrap() {
            VersionProgress::Done {
                version,
                raw_line,
                consumed,
                prelude,
            } => {
                assert_eq!(version.software, "test");
                assert_eq!(raw_line, "SSH-2.0-test");
                assert_eq!(consumed, 14);
                assert!(prelude.is_empty());
            }
            VersionProgress::Incomplete => panic!("expected Done"),
        }
    }

    #[test]
    fn test_reader_byte_at_a_time() {
        let mut reader = VersionReader::new();
        let line = b"SSH-2.0-test\r\n";
        for &b in &line[..line.len() - 1] {
            assert_eq!(reader.feed(&[b]).unwrap(), VersionProgress::Incomplete);
        }
        assert!(matches!(
            reader.feed(&[b'\n']).unwrap(),
            VersionProgress::Done { .. }
        ));
    }

    #[test]
    fn test_reader_leaves_trailing_packet_bytes() {
        let mut reader = VersionReader::new();
        let input = b"SSH-2.0-test\r\n\x00\x00\x00\x0c";
        match reader.feed(input).unwrap() {
            VersionProgress::Done { consumed, .. } => assert_eq!(consumed, 14),
            VersionProgress::Incomplete => panic!("expected Done"),
        }
    }

    #[test]
    fn test_reader_collects_prelude() {
        let mut reader = VersionReader::new();
        match reader.feed(b"welcome to host\r\nSSH-2.0-test\r\n").unwrap() {
            VersionProgress::Done { prelude, .. } => {
                assert_eq!(prelude, vec!["welcome to host".to_string()]);
            }
            VersionProgress::Incomplete => panic!("expected Done"),
        }
    }

    #[test]
    fn test_reader_rejects_overlong_ssh_line() {
        let mut reader = VersionReader::new();
        let mut line = b"SSH-2.0-".to_vec();
        line.extend(std::iter::repeat(b'x').take(300));
        assert!(reader.feed(&line).is_err());
    }
}
