use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::NetError;
use crate::socket::{Connector, Socket};

/// A shared cache of open connections keyed by remote address.
///
/// The registry is injected explicitly into every component that needs it;
/// there is deliberately no process-global instance. One connection per
/// address; sockets are wrapped in a mutex because the transport's
/// control-plane operations take `&mut self` and must not run concurrently
/// on one connection.
pub struct ConnectionRegistry<S: Socket> {
    connections: DashMap<SocketAddr, Arc<Mutex<S>>>,
}

impl<S: Socket> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Retrieve an existing connection or establish a new one via `connector`.
    pub fn get_or_connect<C>(
        &self,
        addr: SocketAddr,
        connector: &C,
    ) -> Result<Arc<Mutex<S>>, NetError>
    where
        C: Connector<Socket = S>,
    {
        // Fast path: return the cached connection.
        if let Some(entry) = self.connections.get(&addr) {
            return Ok(Arc::clone(entry.value()));
        }

        let socket = connector.connect(addr)?;
        tracing::debug!(%addr, "registry established new connection");
        let arc = Arc::new(Mutex::new(socket));
        self.connections.insert(addr, Arc::clone(&arc));
        Ok(arc)
    }

    /// Drop a connection from the cache, e.g. after a communication error.
    pub fn remove(&self, addr: &SocketAddr) {
        self.connections.remove(addr);
    }

    pub fn clear(&self) {
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<S: Socket> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSocket {
        peer: SocketAddr,
    }

    impl Socket for MockSocket {
        fn send(&mut self, buf: &[u8]) -> Result<usize, NetError> {
            Ok(buf.len())
        }
        fn recv(&mut self, _buf: &mut [u8], _timeout_ms: u64) -> Result<usize, NetError> {
            Err(NetError::Timeout)
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            Some(self.peer)
        }
        fn shutdown(&mut self) -> Result<(), NetError> {
            Ok(())
        }
        fn close(&mut self) {}
        fn check_connection(&mut self) -> Result<(), NetError> {
            Ok(())
        }
    }

    struct MockConnector {
        call_count: AtomicUsize,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                call_count: AtomicUsize::new(0),
            }
        }
    }

    impl Connector for MockConnector {
        type Socket = MockSocket;

        fn connect(&self, addr: SocketAddr) -> Result<MockSocket, NetError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            Ok(MockSocket { peer: addr })
        }
    }

    fn addr(last_octet: u8, port: u16) -> SocketAddr {
        format!("10.0.0.{last_octet}:{port}").parse().unwrap()
    }

    #[test]
    fn test_get_or_connect_caches() {
        let registry = ConnectionRegistry::<MockSocket>::new();
        let connector = MockConnector::new();
        let a = addr(1, 8080);

        let s1 = registry.get_or_connect(a, &connector).unwrap();
        let s2 = registry.get_or_connect(a, &connector).unwrap();

        assert_eq!(connector.call_count.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[test]
    fn test_remove_forces_reconnect() {
        let registry = ConnectionRegistry::<MockSocket>::new();
        let connector = MockConnector::new();
        let a = addr(1, 8080);

        let _ = registry.get_or_connect(a, &connector).unwrap();
        registry.remove(&a);
        let _ = registry.get_or_connect(a, &connector).unwrap();

        assert_eq!(connector.call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear() {
        let registry = ConnectionRegistry::<MockSocket>::new();
        let connector = MockConnector::new();

        let _ = registry.get_or_connect(addr(1, 8080), &connector).unwrap();
        let _ = registry.get_or_connect(addr(2, 8080), &connector).unwrap();
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cached_socket_is_usable() {
        let registry = ConnectionRegistry::<MockSocket>::new();
        let connector = MockConnector::new();
        let a = addr(3, 9000);

        let sock = registry.get_or_connect(a, &connector).unwrap();
        let mut guard = sock.lock();
        assert_eq!(guard.send(b"ping").unwrap(), 4);
        assert_eq!(guard.peer_addr(), Some(a));
    }
}
