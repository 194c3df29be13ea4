//! Transport error taxonomy.
//!
//! Three classes matter to callers: a timeout (the socket is still good), a
//! communication error (CM/verbs failure or protocol violation; discard and
//! reconnect), and the sticky invalidated state every later operation hits
//! after a communication error.

use parfs_net::NetError;
use thiserror::Error;

pub type RdmaResult<T> = Result<T, RdmaError>;

#[derive(Debug, Error)]
pub enum RdmaError {
    /// No event occurred within the caller's time budget.
    #[error("timeout")]
    Timeout,

    /// The peer's handshake record could not be accepted.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The peer (or our own queue pair) violated the wire protocol:
    /// unexpected completion opcode or ID, bad control-packet length,
    /// credit underflow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Requested buffer geometry is outside the allowed limits.
    #[error("invalid buffer geometry: {0}")]
    Geometry(String),

    /// A libibverbs call failed.
    #[error("verbs failure in {op}: {source}")]
    Verbs {
        op: &'static str,
        source: std::io::Error,
    },

    /// An RDMA CM call or event-channel operation failed.
    #[error("cm failure in {op}: {source}")]
    Cm {
        op: &'static str,
        source: std::io::Error,
    },

    /// The peer disconnected.
    #[error("connection closed by peer")]
    Disconnected,

    /// The peer rejected the connection attempt.
    #[error("connection rejected by peer")]
    Rejected,

    /// Hostname resolution produced no usable address.
    #[error("address resolution failed for {0}")]
    AddrResolution(String),

    /// A previous communication error invalidated this socket.
    #[error("socket invalidated by previous failure")]
    Invalidated,
}

impl RdmaError {
    /// Capture `errno` for a failed verbs call, logging the OS error string.
    pub(crate) fn verbs(op: &'static str) -> Self {
        let source = std::io::Error::last_os_error();
        tracing::error!(op, error = %source, "verbs call failed");
        RdmaError::Verbs { op, source }
    }

    /// Capture `errno` for a failed CM call, logging the OS error string.
    pub(crate) fn cm(op: &'static str) -> Self {
        let source = std::io::Error::last_os_error();
        tracing::error!(op, error = %source, "rdma cm call failed");
        RdmaError::Cm { op, source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RdmaError::Timeout)
    }

    /// Whether this error must invalidate the socket. Everything except a
    /// timeout counts as a communication error.
    pub fn invalidates_socket(&self) -> bool {
        !self.is_timeout()
    }
}

impl From<RdmaError> for NetError {
    fn from(err: RdmaError) -> Self {
        match err {
            RdmaError::Timeout => NetError::Timeout,
            RdmaError::Disconnected => NetError::ConnectionClosed,
            RdmaError::Rejected => NetError::ConnectionRefused,
            RdmaError::Invalidated => NetError::Invalidated,
            RdmaError::AddrResolution(host) => NetError::AddrResolution(host),
            other => NetError::Comm(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_does_not_invalidate() {
        assert!(RdmaError::Timeout.is_timeout());
        assert!(!RdmaError::Timeout.invalidates_socket());
    }

    #[test]
    fn test_comm_errors_invalidate() {
        assert!(RdmaError::Handshake("bad magic".into()).invalidates_socket());
        assert!(RdmaError::Protocol("unexpected opcode".into()).invalidates_socket());
        assert!(RdmaError::Disconnected.invalidates_socket());
    }

    #[test]
    fn test_net_error_mapping() {
        assert!(matches!(NetError::from(RdmaError::Timeout), NetError::Timeout));
        assert!(matches!(
            NetError::from(RdmaError::Disconnected),
            NetError::ConnectionClosed
        ));
        assert!(matches!(
            NetError::from(RdmaError::Rejected),
            NetError::ConnectionRefused
        ));
        assert!(matches!(
            NetError::from(RdmaError::Handshake("x".into())),
            NetError::Comm(_)
        ));
    }

    #[test]
    fn test_display() {
        let err = RdmaError::Geometry("buffer size below 4 KiB".into());
        assert!(err.to_string().contains("4 KiB"));
    }
}
