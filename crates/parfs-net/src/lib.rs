//! Abstract networking surface for the parfs daemons.
//!
//! The metadata, storage, and management services talk to each other through
//! the small synchronous socket interface defined here; the concrete
//! transport lives in its own crate (`parfs-net-rdma`). Connection pooling is
//! provided by [`ConnectionRegistry`], which callers receive by explicit
//! injection rather than through a process-global.

pub mod error;
pub mod registry;
pub mod socket;

pub use error::NetError;
pub use registry::ConnectionRegistry;
pub use socket::{Accepted, Connector, Listener, Socket};
