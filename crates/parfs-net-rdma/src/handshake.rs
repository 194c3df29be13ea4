//! Connection handshake record.
//!
//! Exchanged as CM private data during connect/accept. Fixed size, packed,
//! little-endian multi-byte fields. There is no backward compatibility: the
//! magic and the protocol version must match exactly, anything else aborts
//! the handshake before a connection context exists.

use crate::error::{RdmaError, RdmaResult};

/// 8-byte magic identifying a parfs RDMA peer.
pub const HANDSHAKE_MAGIC: [u8; 8] = *b"PARFS-IB";

/// Wire protocol version. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u64 = 1;

/// Encoded size: magic + version + vaddr + rkey + buf_num + buf_size.
pub const HANDSHAKE_WIRE_SIZE: usize = 8 + 8 + 8 + 4 + 4 + 4;

/// The negotiated connection parameters a peer advertises.
///
/// `vaddr`/`rkey` name the peer's remotely readable control word, the target
/// of the one-word liveness probe. `recv_buf_num`/`recv_buf_size` are the
/// peer's receive-ring geometry; our sends must fit those buffers.
/// Immutable once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub vaddr: u64,
    pub rkey: u32,
    pub recv_buf_num: u32,
    pub recv_buf_size: u32,
}

impl HandshakeRecord {
    /// Encode for transmission as CM private data.
    pub fn to_wire(&self) -> [u8; HANDSHAKE_WIRE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_WIRE_SIZE];
        buf[0..8].copy_from_slice(&HANDSHAKE_MAGIC);
        buf[8..16].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf[16..24].copy_from_slice(&self.vaddr.to_le_bytes());
        buf[24..28].copy_from_slice(&self.rkey.to_le_bytes());
        buf[28..32].copy_from_slice(&self.recv_buf_num.to_le_bytes());
        buf[32..36].copy_from_slice(&self.recv_buf_size.to_le_bytes());
        buf
    }

    /// Parse a peer's private data.
    ///
    /// The CM may pad private data beyond what the peer supplied; trailing
    /// bytes are tolerated, a short record is not.
    pub fn parse(data: &[u8]) -> RdmaResult<Self> {
        if data.len() < HANDSHAKE_WIRE_SIZE {
            return Err(RdmaError::Handshake(format!(
                "private data too short: {} bytes, need {}",
                data.len(),
                HANDSHAKE_WIRE_SIZE
            )));
        }

        if data[0..8] != HANDSHAKE_MAGIC {
            return Err(RdmaError::Handshake(format!(
                "bad magic {:02x?}",
                &data[0..8]
            )));
        }

        let version = u64::from_le_bytes(data[8..16].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(RdmaError::Handshake(format!(
                "protocol version mismatch: peer {}, local {}",
                version, PROTOCOL_VERSION
            )));
        }

        let record = Self {
            vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            rkey: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            recv_buf_num: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            recv_buf_size: u32::from_le_bytes(data[32..36].try_into().unwrap()),
        };

        // The credit window is one less than the ring and data chunks are
        // at least 2 bytes; a peer below either floor cannot be driven.
        if record.recv_buf_num < 2 || record.recv_buf_size < 2 {
            return Err(RdmaError::Handshake(format!(
                "unusable peer ring geometry: {} buffers of {} bytes",
                record.recv_buf_num, record.recv_buf_size
            )));
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HandshakeRecord {
        HandshakeRecord {
            vaddr: 0xdead_beef_0000_1000,
            rkey: 0x1234_5678,
            recv_buf_num: 32,
            recv_buf_size: 16 * 1024,
        }
    }

    #[test]
    fn test_roundtrip() {
        let record = sample();
        let wire = record.to_wire();
        assert_eq!(wire.len(), HANDSHAKE_WIRE_SIZE);
        assert_eq!(HandshakeRecord::parse(&wire).unwrap(), record);
    }

    #[test]
    fn test_trailing_padding_tolerated() {
        let mut padded = sample().to_wire().to_vec();
        // The CM rounds private data up; peers must ignore the tail.
        padded.extend_from_slice(&[0u8; 56]);
        assert_eq!(HandshakeRecord::parse(&padded).unwrap(), sample());
    }

    #[test]
    fn test_short_record_rejected() {
        let wire = sample().to_wire();
        let err = HandshakeRecord::parse(&wire[..HANDSHAKE_WIRE_SIZE - 1]).unwrap_err();
        assert!(matches!(err, RdmaError::Handshake(_)));
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut wire = sample().to_wire();
        wire[0] ^= 0xff;
        let err = HandshakeRecord::parse(&wire).unwrap_err();
        assert!(matches!(err, RdmaError::Handshake(_)));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_version_off_by_one_rejected() {
        let mut wire = sample().to_wire();
        wire[8..16].copy_from_slice(&(PROTOCOL_VERSION + 1).to_le_bytes());
        let err = HandshakeRecord::parse(&wire).unwrap_err();
        assert!(err.to_string().contains("version"));

        // Version zero (off by one downward) is equally fatal.
        let mut wire = sample().to_wire();
        wire[8..16].copy_from_slice(&(PROTOCOL_VERSION - 1).to_le_bytes());
        assert!(HandshakeRecord::parse(&wire).is_err());
    }

    #[test]
    fn test_degenerate_ring_geometry_rejected() {
        for (buf_num, buf_size) in [(0u32, 16384u32), (1, 16384), (32, 0), (32, 1)] {
            let mut record = sample();
            record.recv_buf_num = buf_num;
            record.recv_buf_size = buf_size;
            let err = HandshakeRecord::parse(&record.to_wire()).unwrap_err();
            assert!(matches!(err, RdmaError::Handshake(_)));
            assert!(err.to_string().contains("ring geometry"));
        }
    }

    #[test]
    fn test_fields_are_little_endian() {
        let wire = sample().to_wire();
        assert_eq!(&wire[24..28], &0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn test_empty_private_data_rejected() {
        assert!(HandshakeRecord::parse(&[]).is_err());
    }
}
