use std::net::SocketAddr;

use crate::error::NetError;

/// A reliable, connected byte-stream socket.
///
/// Implementations may use RDMA, TCP, or in-memory channels for testing; each
/// lives in its own crate (e.g. `parfs-net-rdma`). The transport is driven
/// synchronously by the calling thread: blocking operations suspend only that
/// thread, and cancellation is cooperative via the millisecond timeouts.
///
/// A socket must not be shared between threads for these control-plane
/// operations; one worker thread owns each connection.
pub trait Socket: Send {
    /// Send the whole buffer. Returns the number of bytes sent (always
    /// `buf.len()` on success).
    fn send(&mut self, buf: &[u8]) -> Result<usize, NetError>;

    /// Receive up to `buf.len()` bytes, waiting at most `timeout_ms`.
    ///
    /// Returns the number of bytes received (zero only when `buf` is
    /// empty), or `Err(NetError::Timeout)` if no data arrived within the
    /// budget. Any other error invalidates the socket.
    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, NetError>;

    /// Return the remote peer address.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Flush outstanding sends and announce disconnect to the peer.
    fn shutdown(&mut self) -> Result<(), NetError>;

    /// Release all transport resources. Safe to call more than once and on a
    /// never-connected socket.
    fn close(&mut self);

    /// Actively probe the connection for liveness.
    fn check_connection(&mut self) -> Result<(), NetError>;
}

/// Outcome of one `Listener::accept` call.
///
/// Connection-manager channels deliver events that are not new connections
/// (late disconnects of unrelated children, rejected handshakes). Those are
/// consumed and reported as `Ignored` so the accept loop simply calls again;
/// they never bubble up as application failures.
#[derive(Debug)]
pub enum Accepted<S> {
    /// A new, fully connected socket and the peer's address.
    Connection(S, SocketAddr),
    /// A spurious or uninteresting event was consumed; call `accept` again.
    Ignored,
}

/// A bound endpoint accepting incoming connections.
pub trait Listener: Send {
    type Socket: Socket;

    /// Wait for and service the next event on the listening channel.
    ///
    /// Errors indicate a channel failure; per-connection problems (bad
    /// handshake, stale events) surface as `Accepted::Ignored`.
    fn accept(&mut self) -> Result<Accepted<Self::Socket>, NetError>;

    /// Whether more events are already queued, so an accept loop can drain
    /// them before blocking elsewhere.
    fn events_pending(&self) -> bool;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Establishes outbound connections.
pub trait Connector: Send + Sync {
    type Socket: Socket;

    fn connect(&self, addr: SocketAddr) -> Result<Self::Socket, NetError>;
}
