//! Buffer pool: ring geometry and registered (pinned) memory.
//!
//! Each connection owns one page-aligned block per direction, carved into
//! `buf_num` chunks of `buf_size` bytes and registered with the device, plus
//! two single-word control regions: one advertised to the peer as the target
//! of its liveness probe, one used locally as the landing buffer for ours.

use crate::config::RdmaConfig;
use crate::error::RdmaResult;

/// Ring layout, validated before any memory is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub buf_num: usize,
    pub buf_size: usize,
}

impl BufferGeometry {
    pub fn from_config(config: &RdmaConfig) -> RdmaResult<Self> {
        config.validate()?;
        Ok(Self {
            buf_num: config.buf_num as usize,
            buf_size: config.buf_size as usize,
        })
    }

    /// Total bytes in one direction's block.
    pub fn ring_len(&self) -> usize {
        self.buf_num * self.buf_size
    }

    /// Byte offset of chunk `index` within the block.
    pub fn chunk_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.buf_num);
        index * self.buf_size
    }

    /// Ring index for a work-request counter that increments forever.
    pub fn wrap(&self, counter: u64) -> usize {
        (counter % self.buf_num as u64) as usize
    }
}

#[cfg(feature = "rdma")]
pub use registered::BufferPool;

#[cfg(feature = "rdma")]
mod registered {
    use std::ptr;

    use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_pd, ibv_reg_mr};

    use super::BufferGeometry;
    use crate::error::{RdmaError, RdmaResult};

    /// Page-aligned heap block, freed on drop.
    struct AlignedBlock {
        ptr: *mut u8,
        len: usize,
    }

    impl AlignedBlock {
        fn alloc(len: usize) -> RdmaResult<Self> {
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let mut ptr: *mut libc::c_void = ptr::null_mut();
            let rc = unsafe { libc::posix_memalign(&mut ptr, page, len) };
            if rc != 0 || ptr.is_null() {
                return Err(RdmaError::Verbs {
                    op: "posix_memalign",
                    source: std::io::Error::from_raw_os_error(rc),
                });
            }
            unsafe { ptr::write_bytes(ptr as *mut u8, 0, len) };
            Ok(Self {
                ptr: ptr as *mut u8,
                len,
            })
        }
    }

    impl Drop for AlignedBlock {
        fn drop(&mut self) {
            unsafe { libc::free(self.ptr as *mut libc::c_void) };
        }
    }

    /// One registered memory region and its backing block.
    ///
    /// Deregistration happens exactly once, on drop, before the block is
    /// freed. A failing deregistration (e.g. permission changes on the
    /// pages) is logged and otherwise ignored so teardown always finishes.
    struct RegisteredRegion {
        mr: *mut ibv_mr,
        block: AlignedBlock,
    }

    impl RegisteredRegion {
        fn register(pd: *mut ibv_pd, len: usize) -> RdmaResult<Self> {
            let block = AlignedBlock::alloc(len)?;
            let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
            let mr = unsafe {
                ibv_reg_mr(
                    pd,
                    block.ptr as *mut libc::c_void,
                    len,
                    access.0 as libc::c_int,
                )
            };
            if mr.is_null() {
                // `block` is released by its own drop.
                return Err(RdmaError::verbs("ibv_reg_mr"));
            }
            Ok(Self { mr, block })
        }

        fn addr(&self) -> u64 {
            self.block.ptr as u64
        }

        fn lkey(&self) -> u32 {
            unsafe { (*self.mr).lkey }
        }

        fn rkey(&self) -> u32 {
            unsafe { (*self.mr).rkey }
        }
    }

    impl Drop for RegisteredRegion {
        fn drop(&mut self) {
            let rc = unsafe { ibv_dereg_mr(self.mr) };
            if rc != 0 {
                tracing::warn!(
                    rc,
                    error = %std::io::Error::from_raw_os_error(rc),
                    "ibv_dereg_mr failed during teardown, continuing"
                );
            }
        }
    }

    /// Registered send/receive rings plus the two control words.
    ///
    /// Field order is the reverse of acquisition so drop releases the most
    /// recently acquired resource first.
    pub struct BufferPool {
        probe_word: RegisteredRegion,
        ctrl_word: RegisteredRegion,
        send: RegisteredRegion,
        recv: RegisteredRegion,
        geometry: BufferGeometry,
    }

    // Raw MR pointers are exclusively owned by the pool.
    unsafe impl Send for BufferPool {}

    impl BufferPool {
        /// Allocate and register everything for one connection. Any failure
        /// releases whatever was already acquired.
        pub fn new(pd: *mut ibv_pd, geometry: BufferGeometry) -> RdmaResult<Self> {
            let recv = RegisteredRegion::register(pd, geometry.ring_len())?;
            let send = RegisteredRegion::register(pd, geometry.ring_len())?;
            let ctrl_word = RegisteredRegion::register(pd, std::mem::size_of::<u64>())?;
            let probe_word = RegisteredRegion::register(pd, std::mem::size_of::<u64>())?;
            tracing::debug!(
                buf_num = geometry.buf_num,
                buf_size = geometry.buf_size,
                "registered buffer pool"
            );
            Ok(Self {
                probe_word,
                ctrl_word,
                send,
                recv,
                geometry,
            })
        }

        pub fn geometry(&self) -> BufferGeometry {
            self.geometry
        }

        pub fn recv_lkey(&self) -> u32 {
            self.recv.lkey()
        }

        pub fn send_lkey(&self) -> u32 {
            self.send.lkey()
        }

        /// Device-visible address of receive chunk `index`.
        pub fn recv_chunk_addr(&self, index: usize) -> u64 {
            self.recv.addr() + self.geometry.chunk_offset(index) as u64
        }

        pub fn send_chunk_addr(&self, index: usize) -> u64 {
            self.send.addr() + self.geometry.chunk_offset(index) as u64
        }

        /// Completed receive chunk as a byte slice.
        ///
        /// Only valid for a chunk whose receive completion has been polled
        /// and which has not been reposted.
        pub fn recv_chunk(&self, index: usize) -> &[u8] {
            let offset = self.geometry.chunk_offset(index);
            unsafe {
                std::slice::from_raw_parts(self.recv.block.ptr.add(offset), self.geometry.buf_size)
            }
        }

        /// Send chunk for filling before a post.
        pub fn send_chunk_mut(&mut self, index: usize) -> &mut [u8] {
            let offset = self.geometry.chunk_offset(index);
            unsafe {
                std::slice::from_raw_parts_mut(
                    self.send.block.ptr.add(offset),
                    self.geometry.buf_size,
                )
            }
        }

        /// Address/rkey of the word the peer may read (or write) remotely;
        /// advertised in the handshake record.
        pub fn ctrl_word_vaddr(&self) -> u64 {
            self.ctrl_word.addr()
        }

        pub fn ctrl_word_rkey(&self) -> u32 {
            self.ctrl_word.rkey()
        }

        /// Local landing buffer for the one-word liveness read.
        pub fn probe_word_addr(&self) -> u64 {
            self.probe_word.addr()
        }

        pub fn probe_word_lkey(&self) -> u32 {
            self.probe_word.lkey()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RdmaError;

    fn geometry(buf_num: u32, buf_size: u32) -> BufferGeometry {
        BufferGeometry::from_config(&RdmaConfig {
            buf_num,
            buf_size,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_geometry_from_config() {
        let g = geometry(8, 8192);
        assert_eq!(g.buf_num, 8);
        assert_eq!(g.buf_size, 8192);
        assert_eq!(g.ring_len(), 8 * 8192);
    }

    #[test]
    fn test_geometry_rejects_invalid_config() {
        let config = RdmaConfig {
            buf_size: 16,
            ..Default::default()
        };
        assert!(matches!(
            BufferGeometry::from_config(&config),
            Err(RdmaError::Geometry(_))
        ));
    }

    #[test]
    fn test_chunk_offsets_are_disjoint() {
        let g = geometry(4, 4096);
        let offsets: Vec<usize> = (0..4).map(|i| g.chunk_offset(i)).collect();
        assert_eq!(offsets, vec![0, 4096, 8192, 12288]);
        assert_eq!(g.chunk_offset(3) + g.buf_size, g.ring_len());
    }

    #[test]
    fn test_wrap() {
        let g = geometry(4, 4096);
        assert_eq!(g.wrap(0), 0);
        assert_eq!(g.wrap(3), 3);
        assert_eq!(g.wrap(4), 0);
        assert_eq!(g.wrap(u64::MAX / 2), (u64::MAX / 2 % 4) as usize);
    }
}
