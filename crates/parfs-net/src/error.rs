use thiserror::Error;

/// Errors surfaced by the networking layer.
///
/// The taxonomy distinguishes three cases callers react to differently:
/// a timeout (retry with the same socket), a communication error (discard
/// the socket and reconnect), and a sticky invalidated socket (every further
/// operation fails without touching the transport again).
#[derive(Debug, Error)]
pub enum NetError {
    /// No event occurred within the caller's time budget.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection attempt was refused or rejected by the remote peer.
    #[error("connection refused")]
    ConnectionRefused,

    /// The socket was invalidated by an earlier failure; reconnect to recover.
    #[error("socket invalidated by previous failure")]
    Invalidated,

    /// Hostname or address resolution failed.
    #[error("address resolution failed: {0}")]
    AddrResolution(String),

    /// A transport-level failure or protocol violation.
    #[error("communication error: {0}")]
    Comm(String),

    /// An I/O error from the underlying OS primitives.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether this error is a plain timeout (the socket is still usable).
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    /// Whether the caller should discard the socket and reconnect.
    pub fn is_fatal(&self) -> bool {
        !self.is_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(NetError::Timeout.to_string(), "timeout");
        assert_eq!(NetError::ConnectionClosed.to_string(), "connection closed");
        assert!(NetError::Comm("bad magic".into())
            .to_string()
            .contains("bad magic"));
    }

    #[test]
    fn test_timeout_is_not_fatal() {
        assert!(NetError::Timeout.is_timeout());
        assert!(!NetError::Timeout.is_fatal());
        assert!(NetError::ConnectionClosed.is_fatal());
        assert!(NetError::Invalidated.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let err: NetError = io_err.into();
        assert!(matches!(err, NetError::Io(_)));
        assert!(err.to_string().contains("pipe broke"));
    }
}
