//! Connection context and completion engine.
//!
//! Created exactly once per connection, at successful establishment, and
//! owned exclusively by its socket. Owns the queue pair, both completion
//! queues, the completion event channel, the registered buffer pool, the
//! flow-control counters, and the partial-operation state.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use rdma_sys::{
    ibv_ack_cq_events, ibv_alloc_pd, ibv_comp_channel, ibv_cq, ibv_create_comp_channel,
    ibv_create_cq, ibv_dealloc_pd, ibv_destroy_comp_channel, ibv_destroy_cq, ibv_get_cq_event,
    ibv_pd, ibv_poll_cq, ibv_post_recv, ibv_post_send, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask,
    ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_query_qp, ibv_recv_wr, ibv_req_notify_cq,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc, ibv_wc_opcode, ibv_wc_status, ibv_wr_opcode,
    rdma_cm_event_type, rdma_cm_id, rdma_create_qp, rdma_destroy_qp,
};

use crate::buf::{BufferGeometry, BufferPool};
use crate::cm;
use crate::config::RdmaConfig;
use crate::error::{RdmaError, RdmaResult};
use crate::flow::FlowState;
use crate::handshake::HandshakeRecord;
use crate::partial::{PartialRecv, PendingSends};
use crate::verbs::{Epoll, EP_TOKEN_CM, EP_TOKEN_COMP};

/// Work-request ID tagging. Receive IDs are `RECV_WORK_ID_OFFSET + index`,
/// send IDs `SEND_WORK_ID_OFFSET + index`; the liveness read uses a single
/// ID outside both ranges. A completion whose ID falls outside the expected
/// range indicates queue-pair state corruption and is a hard error.
pub(crate) const RECV_WORK_ID_OFFSET: u64 = 1;
pub(crate) const SEND_WORK_ID_OFFSET: u64 = 1 << 16;
pub(crate) const READ_WORK_ID: u64 = 1 << 32;

/// A polled receive completion: ring index and payload length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvCompletion {
    pub index: usize,
    pub len: usize,
}

pub(crate) struct ConnectionContext {
    cm_id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    comp_channel: *mut ibv_comp_channel,
    recv_cq: *mut ibv_cq,
    send_cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    pool: Option<BufferPool>,
    epoll: Option<Epoll>,

    pub(crate) flow: FlowState,
    pub(crate) partial_recv: Option<PartialRecv>,
    pub(crate) pending_sends: PendingSends,
    /// Ever-incrementing send-post counter; wraps onto the ring.
    send_counter: u64,
    /// Completion-channel events not yet acknowledged.
    unacked_events: u32,
    event_ack_batch: u32,
    poll_timeout_ms: u64,
    peer: Option<HandshakeRecord>,
    destroyed: bool,
}

// Owned exclusively by one socket; never shared between threads.
unsafe impl Send for ConnectionContext {}

impl ConnectionContext {
    /// Build everything a connection needs before connect/accept: protection
    /// domain, completion channel and queues, queue pair, registered buffer
    /// pool, readiness multiplexer; then prime the receive pipeline by
    /// posting one receive per ring buffer.
    ///
    /// `watch_cm` adds the CM channel descriptor to the readiness
    /// multiplexer so a disconnect interrupts blocked receives; accepted
    /// sockets pass `false` because they share the listener's channel and
    /// must not steal its events.
    ///
    /// On any failure the partially acquired resources are released by the
    /// drop path.
    pub(crate) fn new(
        cm_id: *mut rdma_cm_id,
        config: &RdmaConfig,
        watch_cm: bool,
    ) -> RdmaResult<Self> {
        let geometry = BufferGeometry::from_config(config)?;

        let mut ctx = Self {
            cm_id,
            pd: ptr::null_mut(),
            comp_channel: ptr::null_mut(),
            recv_cq: ptr::null_mut(),
            send_cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            pool: None,
            epoll: None,
            flow: FlowState::new(config.buf_num),
            partial_recv: None,
            pending_sends: PendingSends::new(),
            send_counter: 0,
            unacked_events: 0,
            event_ack_batch: config.event_ack_batch,
            poll_timeout_ms: config.poll_timeout_ms,
            peer: None,
            destroyed: false,
        };

        let verbs = unsafe { (*cm_id).verbs };
        if verbs.is_null() {
            return Err(RdmaError::Cm {
                op: "cm_id.verbs",
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "cm identifier has no device context",
                ),
            });
        }

        ctx.pd = unsafe { ibv_alloc_pd(verbs) };
        if ctx.pd.is_null() {
            return Err(RdmaError::verbs("ibv_alloc_pd"));
        }

        ctx.comp_channel = unsafe { ibv_create_comp_channel(verbs) };
        if ctx.comp_channel.is_null() {
            return Err(RdmaError::verbs("ibv_create_comp_channel"));
        }

        let cqe = config.cq_entries() as libc::c_int;
        ctx.recv_cq =
            unsafe { ibv_create_cq(verbs, cqe, ptr::null_mut(), ctx.comp_channel, 0) };
        if ctx.recv_cq.is_null() {
            return Err(RdmaError::verbs("ibv_create_cq(recv)"));
        }
        // The send CQ is polled synchronously and needs no event channel.
        ctx.send_cq = unsafe { ibv_create_cq(verbs, cqe, ptr::null_mut(), ptr::null_mut(), 0) };
        if ctx.send_cq.is_null() {
            return Err(RdmaError::verbs("ibv_create_cq(send)"));
        }

        if unsafe { ibv_req_notify_cq(ctx.recv_cq, 0) } != 0 {
            return Err(RdmaError::verbs("ibv_req_notify_cq"));
        }

        let mut qp_attr: ibv_qp_init_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        qp_attr.send_cq = ctx.send_cq;
        qp_attr.recv_cq = ctx.recv_cq;
        qp_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        qp_attr.sq_sig_all = 0;
        qp_attr.cap.max_send_wr = config.qp_max_send_wr();
        qp_attr.cap.max_recv_wr = config.qp_max_recv_wr();
        qp_attr.cap.max_send_sge = 1;
        qp_attr.cap.max_recv_sge = 1;

        if unsafe { rdma_create_qp(cm_id, ctx.pd, &mut qp_attr) } != 0 {
            return Err(RdmaError::cm("rdma_create_qp"));
        }
        ctx.qp = unsafe { (*cm_id).qp };

        ctx.pool = Some(BufferPool::new(ctx.pd, geometry)?);

        let epoll = Epoll::new()?;
        epoll.add(unsafe { (*ctx.comp_channel).fd }, EP_TOKEN_COMP)?;
        if watch_cm {
            epoll.add(cm::channel_fd(unsafe { (*cm_id).channel }), EP_TOKEN_CM)?;
        }
        ctx.epoll = Some(epoll);

        for index in 0..geometry.buf_num {
            ctx.post_recv(index)?;
        }

        Ok(ctx)
    }

    fn pool(&self) -> &BufferPool {
        self.pool.as_ref().expect("buffer pool present until teardown")
    }

    pub(crate) fn geometry(&self) -> BufferGeometry {
        self.pool().geometry()
    }

    /// The handshake record advertising this side's control word and
    /// receive-ring geometry.
    pub(crate) fn local_record(&self) -> HandshakeRecord {
        let pool = self.pool();
        let geometry = pool.geometry();
        HandshakeRecord {
            vaddr: pool.ctrl_word_vaddr(),
            rkey: pool.ctrl_word_rkey(),
            recv_buf_num: geometry.buf_num as u32,
            recv_buf_size: geometry.buf_size as u32,
        }
    }

    /// Record the peer's handshake and cap the send window by its
    /// receive-ring size; a peer with fewer buffers than ours would
    /// otherwise be overrun into an RNR condition.
    pub(crate) fn set_peer(&mut self, peer: HandshakeRecord) {
        self.flow.limit_send_window(peer.recv_buf_num);
        self.peer = Some(peer);
    }

    pub(crate) fn peer(&self) -> RdmaResult<&HandshakeRecord> {
        self.peer
            .as_ref()
            .ok_or_else(|| RdmaError::Protocol("no peer handshake record".into()))
    }

    pub(crate) fn comp_channel_fd(&self) -> RawFd {
        unsafe { (*self.comp_channel).fd }
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Enqueue one receive work request for ring buffer `index`. Used to
    /// prime the pipeline at setup and to repost each buffer once drained.
    pub(crate) fn post_recv(&mut self, index: usize) -> RdmaResult<()> {
        let pool = self.pool();
        let mut sge = ibv_sge {
            addr: pool.recv_chunk_addr(index),
            length: pool.geometry().buf_size as u32,
            lkey: pool.recv_lkey(),
        };
        let mut wr: ibv_recv_wr = unsafe { MaybeUninit::zeroed().assume_init() };
        wr.wr_id = RECV_WORK_ID_OFFSET + index as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut ibv_recv_wr = ptr::null_mut();
        if unsafe { ibv_post_recv(self.qp, &mut wr, &mut bad_wr) } != 0 {
            return Err(RdmaError::verbs("ibv_post_recv"));
        }
        Ok(())
    }

    /// Pick the send ring buffer for the next post. Indices cycle through
    /// the ring, so a buffer is reused only after `buf_num` posts, by which
    /// point the batched reclaim has run.
    pub(crate) fn next_send_index(&mut self) -> usize {
        let index = self.geometry().wrap(self.send_counter);
        self.send_counter += 1;
        index
    }

    /// Fill send buffer `index` with `data` and post it.
    ///
    /// Always requests a completion signal. On success the flow-control
    /// counters are updated; the caller must have waited out exhausted
    /// send credits beforehand.
    pub(crate) fn post_send(&mut self, index: usize, data: &[u8]) -> RdmaResult<()> {
        debug_assert!(data.len() <= self.geometry().buf_size);

        let pool = self.pool.as_mut().expect("buffer pool present until teardown");
        pool.send_chunk_mut(index)[..data.len()].copy_from_slice(data);

        let mut sge = ibv_sge {
            addr: pool.send_chunk_addr(index),
            length: data.len() as u32,
            lkey: pool.send_lkey(),
        };
        let mut wr: ibv_send_wr = unsafe { MaybeUninit::zeroed().assume_init() };
        wr.wr_id = SEND_WORK_ID_OFFSET + index as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        if unsafe { ibv_post_send(self.qp, &mut wr, &mut bad_wr) } != 0 {
            return Err(RdmaError::verbs("ibv_post_send"));
        }

        self.pending_sends.on_posted();
        self.flow.on_packet_sent()
    }

    /// Post the one-word RDMA read of the peer's control region used as a
    /// liveness probe.
    pub(crate) fn post_probe_read(&mut self) -> RdmaResult<()> {
        let peer = *self.peer()?;
        let pool = self.pool();

        let mut sge = ibv_sge {
            addr: pool.probe_word_addr(),
            length: std::mem::size_of::<u64>() as u32,
            lkey: pool.probe_word_lkey(),
        };
        let mut wr: ibv_send_wr = unsafe { MaybeUninit::zeroed().assume_init() };
        wr.wr_id = READ_WORK_ID;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.rdma.remote_addr = peer.vaddr;
        wr.wr.rdma.rkey = peer.rkey;

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        if unsafe { ibv_post_send(self.qp, &mut wr, &mut bad_wr) } != 0 {
            return Err(RdmaError::verbs("ibv_post_send(read)"));
        }
        Ok(())
    }

    /// Completed receive chunk `index` as a byte slice.
    pub(crate) fn recv_chunk(&self, index: usize) -> &[u8] {
        self.pool().recv_chunk(index)
    }

    // ------------------------------------------------------------------
    // Completion draining
    // ------------------------------------------------------------------

    fn poll_recv_cq(&mut self) -> RdmaResult<Option<RecvCompletion>> {
        let mut wc: ibv_wc = unsafe { MaybeUninit::zeroed().assume_init() };
        let n = unsafe { ibv_poll_cq(self.recv_cq, 1, &mut wc) };
        if n < 0 {
            return Err(RdmaError::verbs("ibv_poll_cq(recv)"));
        }
        if n == 0 {
            return Ok(None);
        }

        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            return Err(RdmaError::Protocol(format!(
                "receive completion failed with status {} (wr_id {})",
                wc.status, wc.wr_id
            )));
        }
        if wc.opcode != ibv_wc_opcode::IBV_WC_RECV {
            return Err(RdmaError::Protocol(format!(
                "received bad/unexpected completion opcode {} on recv queue",
                wc.opcode
            )));
        }
        let buf_num = self.geometry().buf_num as u64;
        if wc.wr_id < RECV_WORK_ID_OFFSET || wc.wr_id >= RECV_WORK_ID_OFFSET + buf_num {
            return Err(RdmaError::Protocol(format!(
                "receive completion with unexpected id {}",
                wc.wr_id
            )));
        }

        self.flow.on_packet_received()?;
        Ok(Some(RecvCompletion {
            index: (wc.wr_id - RECV_WORK_ID_OFFSET) as usize,
            len: wc.byte_len as usize,
        }))
    }

    /// Block until the next receive completion or the timeout.
    ///
    /// Tries a non-blocking poll first; on miss, waits on the readiness
    /// multiplexer with a bounded sub-timeout so a half-open peer is
    /// noticed within `poll_timeout_ms` even under a long caller budget.
    /// Completion-channel events are acknowledged in batches to amortize
    /// the acknowledgment cost. A CM event arriving on the same multiplexer
    /// is consumed and reported as an error (disconnect or worse).
    ///
    /// Returns `Ok(None)` on timeout.
    pub(crate) fn wait_recv_completion(
        &mut self,
        timeout_ms: u64,
    ) -> RdmaResult<Option<RecvCompletion>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if let Some(completion) = self.poll_recv_cq()? {
                return Ok(Some(completion));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = (deadline - now).as_millis() as u64;
            let slice = remaining.min(self.poll_timeout_ms).max(1);

            let epoll = self.epoll.as_ref().expect("epoll present until teardown");
            match epoll.wait(slice)? {
                None => continue,
                Some(EP_TOKEN_CM) => return Err(self.consume_cm_event_as_error()),
                Some(token) => {
                    debug_assert_eq!(token, EP_TOKEN_COMP);
                    self.consume_comp_event()?;
                }
            }
        }
    }

    /// Take one completion-channel event, batch-acknowledge, and re-arm.
    fn consume_comp_event(&mut self) -> RdmaResult<()> {
        let mut cq: *mut ibv_cq = ptr::null_mut();
        let mut cq_context: *mut libc::c_void = ptr::null_mut();
        if unsafe { ibv_get_cq_event(self.comp_channel, &mut cq, &mut cq_context) } != 0 {
            return Err(RdmaError::verbs("ibv_get_cq_event"));
        }
        if cq != self.recv_cq {
            return Err(RdmaError::Protocol(
                "completion event for unexpected queue".into(),
            ));
        }

        self.unacked_events += 1;
        if self.unacked_events >= self.event_ack_batch {
            unsafe { ibv_ack_cq_events(self.recv_cq, self.unacked_events) };
            self.unacked_events = 0;
        }

        if unsafe { ibv_req_notify_cq(self.recv_cq, 0) } != 0 {
            return Err(RdmaError::verbs("ibv_req_notify_cq"));
        }
        Ok(())
    }

    /// A CM event on a connected handle means the connection is going away.
    fn consume_cm_event_as_error(&mut self) -> RdmaError {
        let channel = unsafe { (*self.cm_id).channel };
        match cm::take_event(channel) {
            Ok(event) => {
                let kind = event.kind();
                drop(event);
                if kind == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED {
                    tracing::debug!("peer disconnected");
                    RdmaError::Disconnected
                } else {
                    RdmaError::Protocol(format!(
                        "unexpected cm event {} on connected handle",
                        cm::event_name(kind)
                    ))
                }
            }
            Err(err) => err,
        }
    }

    /// Poll the send completion queue until the requested counts of each
    /// operation type have been observed. Any failed status, unexpected
    /// opcode, or unexpected ID is a hard error.
    pub(crate) fn wait_send_completions(
        &mut self,
        mut sends: u32,
        mut writes: u32,
        mut reads: u32,
    ) -> RdmaResult<()> {
        let buf_num = self.geometry().buf_num as u64;

        while sends + writes + reads > 0 {
            let mut wc: ibv_wc = unsafe { MaybeUninit::zeroed().assume_init() };
            let n = unsafe { ibv_poll_cq(self.send_cq, 1, &mut wc) };
            if n < 0 {
                return Err(RdmaError::verbs("ibv_poll_cq(send)"));
            }
            if n == 0 {
                std::hint::spin_loop();
                continue;
            }

            if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                return Err(RdmaError::Protocol(format!(
                    "send-side completion failed with status {} (wr_id {})",
                    wc.status, wc.wr_id
                )));
            }

            match wc.opcode {
                ibv_wc_opcode::IBV_WC_SEND => {
                    if sends == 0
                        || wc.wr_id < SEND_WORK_ID_OFFSET
                        || wc.wr_id >= SEND_WORK_ID_OFFSET + buf_num
                    {
                        return Err(RdmaError::Protocol(format!(
                            "received bad/unexpected send completion (wr_id {})",
                            wc.wr_id
                        )));
                    }
                    sends -= 1;
                }
                ibv_wc_opcode::IBV_WC_RDMA_WRITE => {
                    if writes == 0 {
                        return Err(RdmaError::Protocol(
                            "received bad/unexpected rdma-write completion".into(),
                        ));
                    }
                    writes -= 1;
                }
                ibv_wc_opcode::IBV_WC_RDMA_READ => {
                    if reads == 0 || wc.wr_id != READ_WORK_ID {
                        return Err(RdmaError::Protocol(format!(
                            "received bad/unexpected rdma-read completion (wr_id {})",
                            wc.wr_id
                        )));
                    }
                    reads -= 1;
                }
                other => {
                    return Err(RdmaError::Protocol(format!(
                        "received bad/unexpected completion opcode {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reclaim every outstanding send completion in one batch.
    pub(crate) fn reclaim_pending_sends(&mut self) -> RdmaResult<()> {
        let pending = self.pending_sends.take();
        if pending > 0 {
            self.wait_send_completions(pending, 0, 0)?;
        }
        Ok(())
    }

    /// Whether the queue pair is still in an operational state.
    pub(crate) fn qp_operational(&self) -> RdmaResult<bool> {
        let mut attr: ibv_qp_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut init_attr: ibv_qp_init_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        let rc = unsafe {
            ibv_query_qp(
                self.qp,
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as libc::c_int,
                &mut init_attr,
            )
        };
        if rc != 0 {
            return Err(RdmaError::Verbs {
                op: "ibv_query_qp",
                source: std::io::Error::from_raw_os_error(rc),
            });
        }
        Ok(attr.qp_state == ibv_qp_state::IBV_QPS_RTS
            || attr.qp_state == ibv_qp_state::IBV_QPS_RTR)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release everything, once, in reverse acquisition order. Benign
    /// failures are logged and skipped so cleanup always completes.
    pub(crate) fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.epoll = None;

        if !self.qp.is_null() {
            unsafe { rdma_destroy_qp(self.cm_id) };
            self.qp = ptr::null_mut();
        }

        // Deregister after the QP so no posted work request still
        // references the memory regions.
        self.pool = None;

        if self.unacked_events > 0 {
            unsafe { ibv_ack_cq_events(self.recv_cq, self.unacked_events) };
            self.unacked_events = 0;
        }
        if !self.send_cq.is_null() {
            let rc = unsafe { ibv_destroy_cq(self.send_cq) };
            if rc != 0 {
                tracing::warn!(rc, "ibv_destroy_cq(send) failed during teardown");
            }
            self.send_cq = ptr::null_mut();
        }
        if !self.recv_cq.is_null() {
            let rc = unsafe { ibv_destroy_cq(self.recv_cq) };
            if rc != 0 {
                tracing::warn!(rc, "ibv_destroy_cq(recv) failed during teardown");
            }
            self.recv_cq = ptr::null_mut();
        }
        if !self.comp_channel.is_null() {
            let rc = unsafe { ibv_destroy_comp_channel(self.comp_channel) };
            if rc != 0 {
                tracing::warn!(rc, "ibv_destroy_comp_channel failed during teardown");
            }
            self.comp_channel = ptr::null_mut();
        }
        if !self.pd.is_null() {
            let rc = unsafe { ibv_dealloc_pd(self.pd) };
            if rc != 0 {
                tracing::warn!(rc, "ibv_dealloc_pd failed during teardown");
            }
            self.pd = ptr::null_mut();
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
