//! RDMA transport for parfs networking.
//!
//! This crate implements the `Socket`, `Listener`, and `Connector` traits
//! from `parfs-net` directly over InfiniBand verbs and the RDMA connection
//! manager: connection establishment (active and passive), registered
//! buffer rings, a credit-based flow-control protocol, and a completion
//! engine with millisecond timeouts.
//!
//! Actual RDMA functionality requires the `rdma` feature flag and the
//! `libibverbs`/`librdmacm` libraries to be installed. Without the feature,
//! the protocol machinery (configuration, handshake codec, flow-control
//! counters, partial-operation state, buffer geometry) still compiles and
//! is fully testable without RDMA hardware.
//!
//! # Architecture
//!
//! - `RdmaConfig`: buffer geometry, timeouts, type of service, fault
//!   injection.
//! - `HandshakeRecord`: the private-data record exchanged during
//!   connect/accept.
//! - `FlowState`: the per-direction credit counters.
//! - `RdmaSocket`: a reliable byte-stream socket over a queue pair; doubles
//!   as the listener on the passive side.
//! - `RdmaConnector`: factory for outbound connections, usable with the
//!   `parfs-net` connection registry.

pub mod buf;
pub mod config;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod partial;

#[cfg(feature = "rdma")]
mod cm;
#[cfg(feature = "rdma")]
mod context;
#[cfg(feature = "rdma")]
mod socket;
#[cfg(feature = "rdma")]
mod verbs;

pub use buf::BufferGeometry;
pub use config::RdmaConfig;
pub use error::{RdmaError, RdmaResult};
pub use flow::FlowState;
pub use handshake::{HandshakeRecord, HANDSHAKE_WIRE_SIZE, PROTOCOL_VERSION};
pub use partial::{PartialRecv, PendingSends};

#[cfg(feature = "rdma")]
pub use socket::{RdmaConnector, RdmaSocket};
