//! Partial-operation bookkeeping.
//!
//! A receive completion can carry more bytes than the caller asked for; the
//! surplus stays in the ring buffer and is handed out across later `recv`
//! calls before the completion engine is consulted again. Sends are the
//! mirror image: posted work requests whose completions are reclaimed in one
//! batch once the whole send ring is in flight.

/// One in-flight receive: a completed ring buffer being drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRecv {
    buf_index: usize,
    len: usize,
    offset: usize,
}

impl PartialRecv {
    pub fn new(buf_index: usize, len: usize) -> Self {
        Self {
            buf_index,
            len,
            offset: 0,
        }
    }

    /// Ring buffer this receive landed in.
    pub fn buf_index(&self) -> usize {
        self.buf_index
    }

    /// Bytes not yet delivered to the caller.
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    pub fn is_consumed(&self) -> bool {
        self.offset == self.len
    }

    /// Copy the next chunk out of `src` (the completed ring buffer) into
    /// `dst`, advancing the delivered offset. Returns the bytes copied:
    /// the minimum of what remains and what `dst` can hold.
    pub fn drain(&mut self, src: &[u8], dst: &mut [u8]) -> usize {
        debug_assert!(src.len() >= self.len, "ring buffer shorter than completion");
        let n = self.remaining().min(dst.len());
        dst[..n].copy_from_slice(&src[self.offset..self.offset + n]);
        self.offset += n;
        n
    }
}

/// Posted sends whose completions have not been reclaimed yet.
///
/// Completions are reclaimed in one batch only when every send buffer is in
/// flight, not one-by-one; that keeps the send path off the completion queue
/// for all but one post in `buf_num`.
#[derive(Debug, Default, Clone)]
pub struct PendingSends {
    posted: u32,
}

impl PendingSends {
    pub fn new() -> Self {
        Self { posted: 0 }
    }

    pub fn on_posted(&mut self) {
        self.posted += 1;
    }

    pub fn count(&self) -> u32 {
        self.posted
    }

    /// Take the whole batch for reclamation.
    pub fn take(&mut self) -> u32 {
        std::mem::take(&mut self.posted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_smaller_than_available() {
        let ring = b"abcdefgh".to_vec();
        let mut partial = PartialRecv::new(3, 8);

        let mut dst = [0u8; 5];
        let n = partial.drain(&ring, &mut dst);
        assert_eq!(n, 5);
        assert_eq!(&dst, b"abcde");
        assert_eq!(partial.remaining(), 3);
        assert!(!partial.is_consumed());
    }

    #[test]
    fn test_split_boundary_continuation() {
        // Two drains return the same bytes split at the requested boundary,
        // with no loss or duplication.
        let ring = b"0123456789".to_vec();
        let mut partial = PartialRecv::new(0, 10);

        let mut first = [0u8; 4];
        let mut second = [0u8; 16];
        assert_eq!(partial.drain(&ring, &mut first), 4);
        let n = partial.drain(&ring, &mut second);
        assert_eq!(n, 6);

        let mut joined = first.to_vec();
        joined.extend_from_slice(&second[..n]);
        assert_eq!(joined, ring);
        assert!(partial.is_consumed());
        assert_eq!(partial.remaining(), 0);
    }

    #[test]
    fn test_drain_exact_fit() {
        let ring = b"xyz".to_vec();
        let mut partial = PartialRecv::new(1, 3);
        let mut dst = [0u8; 3];
        assert_eq!(partial.drain(&ring, &mut dst), 3);
        assert!(partial.is_consumed());
        assert_eq!(partial.buf_index(), 1);
    }

    #[test]
    fn test_drain_from_larger_ring_buffer() {
        // The completion length can be shorter than the ring buffer.
        let ring = vec![7u8; 4096];
        let mut partial = PartialRecv::new(0, 100);
        let mut dst = [0u8; 4096];
        assert_eq!(partial.drain(&ring, &mut dst), 100);
        assert!(partial.is_consumed());
    }

    #[test]
    fn test_pending_sends_batch() {
        let mut pending = PendingSends::new();
        assert_eq!(pending.count(), 0);

        for _ in 0..5 {
            pending.on_posted();
        }
        assert_eq!(pending.count(), 5);

        assert_eq!(pending.take(), 5);
        assert_eq!(pending.count(), 0);
        assert_eq!(pending.take(), 0);
    }
}
