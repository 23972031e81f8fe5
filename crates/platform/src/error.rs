//! The error taxonomy shared across the Kedge stack.
//!
//! Failures are split by what they say about the connection: [`Frame`]
//! means bytes off the wire were malformed, [`Negotiation`] means the two
//! ends could not agree (versions, algorithms, message sequencing), and
//! [`Trust`] means integrity or authenticity checks failed. The split
//! drives the disconnect reason code a driver reports before tearing a
//! connection down.
//!
//! [`Frame`]: KedgeError::Frame
//! [`Negotiation`]: KedgeError::Negotiation
//! [`Trust`]: KedgeError::Trust

use std::fmt;

/// Unified error type for all Kedge operations.
#[derive(Debug)]
pub enum KedgeError {
    /// The underlying stream failed or closed.
    Io(std::io::Error),

    /// The local endpoint is set up or used incorrectly (missing host key,
    /// sending after disconnect, starting twice).
    Config(String),

    /// Bytes received from the peer do not decode: bad packet framing,
    /// malformed structures, an unparseable identification line.
    Frame(String),

    /// The peer and the local endpoint disagree: no common algorithm, an
    /// unsupported feature, a message outside its allowed phase.
    Negotiation(String),

    /// An integrity or authenticity check failed: MAC mismatch, rejected
    /// host key, degenerate key exchange values, bad key material.
    Trust(String),
}

impl KedgeError {
    /// Whether the failure was caused by the remote peer rather than local
    /// setup or the stream.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            KedgeError::Frame(_) | KedgeError::Negotiation(_) | KedgeError::Trust(_)
        )
    }
}

impl fmt::Display for KedgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, detail): (&str, &dyn fmt::Display) = match self {
            KedgeError::Io(e) => ("io", e),
            KedgeError::Config(msg) => ("config", msg),
            KedgeError::Frame(msg) => ("frame", msg),
            KedgeError::Negotiation(msg) => ("negotiation", msg),
            KedgeError::Trust(msg) => ("trust", msg),
        };
        write!(f, "{kind} error: {detail}")
    }
}

impl std::error::Error for KedgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KedgeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KedgeError {
    fn from(err: std::io::Error) -> Self {
        KedgeError::Io(err)
    }
}

/// Result type for Kedge operations.
pub type KedgeResult<T> = Result<T, KedgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KedgeError::Frame("packet too short".to_string());
        assert_eq!(err.to_string(), "frame error: packet too short");
        let err = KedgeError::Trust("MAC mismatch".to_string());
        assert_eq!(err.to_string(), "trust error: MAC mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream closed");
        let err: KedgeError = io_err.into();
        assert!(matches!(err, KedgeError::Io(_)));
        assert!(!err.is_peer_fault());
    }

    #[test]
    fn test_peer_fault_split() {
        assert!(KedgeError::Negotiation("no common cipher".to_string()).is_peer_fault());
        assert!(KedgeError::Frame("trailing bytes".to_string()).is_peer_fault());
        assert!(!KedgeError::Config("no host key".to_string()).is_peer_fault());
    }
}
