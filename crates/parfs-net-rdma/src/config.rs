//! Transport configuration.

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, RdmaResult};

/// Smallest permitted per-buffer size.
pub const MIN_BUF_SIZE: u32 = 4 * 1024;

/// Largest permitted total size of one buffer ring (`buf_num * buf_size`).
pub const MAX_RING_BYTES: u64 = 128 * 1024 * 1024;

/// Configuration for an RDMA socket.
///
/// Timeouts are cooperative cancellation: there is no cancel token, callers
/// bound every blocking operation in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaConfig {
    /// Number of buffers in each of the send and receive rings.
    #[serde(default = "default_buf_num")]
    pub buf_num: u32,

    /// Size of each ring buffer in bytes.
    #[serde(default = "default_buf_size")]
    pub buf_size: u32,

    /// Budget for the whole outbound connect (address/route resolution is
    /// separate). A peer whose HCA is down can otherwise stall the blocking
    /// connect primitive for minutes.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a sender with exhausted credits waits for any packet from
    /// the peer before giving up.
    #[serde(default = "default_flow_send_timeout_ms")]
    pub flow_send_timeout_ms: u64,

    /// Upper bound for one readiness wait inside a receive. Long waits are
    /// sliced to this so a half-open connection is probed periodically.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Completion-channel events acknowledged in one batch.
    #[serde(default = "default_event_ack_batch")]
    pub event_ack_batch: u32,

    /// Type-of-service byte applied to the CM identifier.
    #[serde(default)]
    pub type_of_service: u8,

    /// Fault injection: probability in `[0, 1]` that an incoming connection
    /// request is synthetically rejected. Zero in production.
    #[serde(default)]
    pub accept_reject_rate: f64,
}

fn default_buf_num() -> u32 {
    32
}
fn default_buf_size() -> u32 {
    16 * 1024
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_flow_send_timeout_ms() -> u64 {
    180_000
}
fn default_poll_timeout_ms() -> u64 {
    7500
}
fn default_event_ack_batch() -> u32 {
    64
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            buf_num: default_buf_num(),
            buf_size: default_buf_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            flow_send_timeout_ms: default_flow_send_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            event_ack_batch: default_event_ack_batch(),
            type_of_service: 0,
            accept_reject_rate: 0.0,
        }
    }
}

impl RdmaConfig {
    /// Validate the buffer geometry before any allocation happens.
    ///
    /// A ring needs at least two buffers: the credit window is
    /// `buf_num - 1`, so a single-buffer ring could never post a send.
    pub fn validate(&self) -> RdmaResult<()> {
        if self.buf_num < 2 {
            return Err(RdmaError::Geometry(format!(
                "buf_num {} below minimum of 2",
                self.buf_num
            )));
        }
        if self.buf_size < MIN_BUF_SIZE {
            return Err(RdmaError::Geometry(format!(
                "buf_size {} below minimum of {} bytes",
                self.buf_size, MIN_BUF_SIZE
            )));
        }
        let ring = self.buf_num as u64 * self.buf_size as u64;
        if ring > MAX_RING_BYTES {
            return Err(RdmaError::Geometry(format!(
                "ring of {} bytes exceeds maximum of {} bytes",
                ring, MAX_RING_BYTES
            )));
        }
        if !(0.0..=1.0).contains(&self.accept_reject_rate) {
            return Err(RdmaError::Geometry(format!(
                "accept_reject_rate {} outside [0, 1]",
                self.accept_reject_rate
            )));
        }
        Ok(())
    }

    /// Maximum send work requests for the queue pair: one per send buffer
    /// plus one slot for the liveness-probe RDMA read.
    pub fn qp_max_send_wr(&self) -> u32 {
        self.buf_num + 1
    }

    /// Maximum receive work requests: one per receive buffer.
    pub fn qp_max_recv_wr(&self) -> u32 {
        self.buf_num
    }

    /// Completion-queue capacity covering both directions.
    pub fn cq_entries(&self) -> u32 {
        self.qp_max_send_wr() + self.qp_max_recv_wr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RdmaConfig::default();
        assert_eq!(config.buf_num, 32);
        assert_eq!(config.buf_size, 16 * 1024);
        assert_eq!(config.connect_timeout_ms, 3000);
        assert_eq!(config.flow_send_timeout_ms, 180_000);
        assert_eq!(config.event_ack_batch, 64);
        assert_eq!(config.accept_reject_rate, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_single_buffer_ring() {
        let config = RdmaConfig {
            buf_num: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RdmaError::Geometry(_))));
    }

    #[test]
    fn test_rejects_small_buffers() {
        let config = RdmaConfig {
            buf_size: 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RdmaError::Geometry(_))));
    }

    #[test]
    fn test_rejects_oversized_ring() {
        let config = RdmaConfig {
            buf_num: 1024,
            buf_size: 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RdmaError::Geometry(_))));
    }

    #[test]
    fn test_ring_at_limit_is_accepted() {
        // 128 buffers of 1 MiB is exactly 128 MiB.
        let config = RdmaConfig {
            buf_num: 128,
            buf_size: 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_fault_rate() {
        let config = RdmaConfig {
            accept_reject_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_qp_sizing() {
        let config = RdmaConfig::default();
        assert_eq!(config.qp_max_send_wr(), 33);
        assert_eq!(config.qp_max_recv_wr(), 32);
        assert_eq!(config.cq_entries(), 65);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = RdmaConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RdmaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buf_num, config.buf_num);
        assert_eq!(back.flow_send_timeout_ms, config.flow_send_timeout_ms);
    }

    #[test]
    fn test_partial_deserialization_takes_defaults() {
        let config: RdmaConfig = serde_json::from_str(r#"{"buf_num": 8}"#).unwrap();
        assert_eq!(config.buf_num, 8);
        assert_eq!(config.buf_size, 16 * 1024);
    }
}
