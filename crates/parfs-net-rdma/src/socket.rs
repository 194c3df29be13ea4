//! The RDMA socket: a reliable byte-stream built from the CM state machine,
//! the connection context, and the credit protocol.
//!
//! One `RdmaSocket` is either an outbound connection, an accepted
//! connection, or a listener. Outbound sockets own a private CM event
//! channel; accepted sockets share the listener's channel (their CM events
//! surface in the listener's accept loop), so their receive path watches
//! only the completion channel and relies on the liveness probe to notice a
//! vanished peer.
//!
//! Any communication error flips the sticky error flag; every later
//! operation fails immediately without touching the queue pair again.
//! Timeouts do not flip the flag.

use std::mem::MaybeUninit;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use rdma_sys::{
    rdma_accept, rdma_bind_addr, rdma_cm_event_type, rdma_cm_id, rdma_conn_param, rdma_connect,
    rdma_create_id, rdma_destroy_id, rdma_disconnect, rdma_listen, rdma_port_space, rdma_reject,
    rdma_resolve_addr, rdma_resolve_route, rdma_set_option, RDMA_OPTION_ID, RDMA_OPTION_ID_TOS,
};

use parfs_net::{Accepted, Connector, Listener, NetError, Socket};

use crate::cm::{self, event_name, CmChannel, CmEvent, DelayedEventQueue};
use crate::config::RdmaConfig;
use crate::context::ConnectionContext;
use crate::error::{RdmaError, RdmaResult};
use crate::flow::data_chunk_len;
use crate::handshake::HandshakeRecord;
use crate::partial::PartialRecv;
use crate::verbs::{poll_readable, sockaddr_to_std};

const LISTEN_BACKLOG: libc::c_int = 128;

/// The 1-byte flow-control packet. Data payloads are framed so no data
/// chunk is ever exactly one byte (see `data_chunk_len`).
const FLOW_ACK: [u8; 1] = [0];

pub struct RdmaSocket {
    config: RdmaConfig,
    /// Private event channel; `None` for accepted sockets, which share the
    /// listener's channel.
    channel: Option<CmChannel>,
    cm_id: *mut rdma_cm_id,
    ctx: Option<ConnectionContext>,
    delayed: DelayedEventQueue,
    err_state: bool,
    listening: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

// Raw CM pointers are exclusively owned; the socket is moved between
// threads, never shared.
unsafe impl Send for RdmaSocket {}

impl RdmaSocket {
    fn new_unbound(config: RdmaConfig) -> RdmaResult<Self> {
        let channel = CmChannel::new()?;
        let mut cm_id: *mut rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            rdma_create_id(
                channel.raw(),
                &mut cm_id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 {
            return Err(RdmaError::cm("rdma_create_id"));
        }
        Ok(Self {
            config,
            channel: Some(channel),
            cm_id,
            ctx: None,
            delayed: DelayedEventQueue::new(),
            err_state: false,
            listening: false,
            local_addr: None,
            peer_addr: None,
        })
    }

    // ------------------------------------------------------------------
    // Active (outbound) path
    // ------------------------------------------------------------------

    /// Connect to a peer by socket address.
    pub fn connect(addr: SocketAddr, config: &RdmaConfig) -> RdmaResult<Self> {
        config.validate()?;
        let mut socket = Self::new_unbound(config.clone())?;
        match socket.connect_inner(addr) {
            Ok(()) => {
                tracing::debug!(%addr, "rdma connection established");
                Ok(socket)
            }
            Err(err) => {
                socket.close();
                Err(err)
            }
        }
    }

    /// Connect by hostname or IP literal.
    pub fn connect_host(host: &str, port: u16, config: &RdmaConfig) -> RdmaResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| RdmaError::AddrResolution(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| RdmaError::AddrResolution(format!("{host}:{port}")))?;
        Self::connect(addr, config)
    }

    fn connect_inner(&mut self, addr: SocketAddr) -> RdmaResult<()> {
        self.apply_type_of_service()?;

        let timeout = self.config.connect_timeout_ms;
        let dst = socket2::SockAddr::from(addr);
        let rc = unsafe {
            rdma_resolve_addr(
                self.cm_id,
                ptr::null_mut(),
                dst.as_ptr() as *mut libc::sockaddr,
                timeout.min(i32::MAX as u64) as libc::c_int,
            )
        };
        if rc != 0 {
            return Err(RdmaError::cm("rdma_resolve_addr"));
        }
        let channel = self.channel_raw()?;
        drop(cm::expect_event(
            channel,
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED,
            timeout,
        )?);

        let rc = unsafe {
            rdma_resolve_route(self.cm_id, timeout.min(i32::MAX as u64) as libc::c_int)
        };
        if rc != 0 {
            return Err(RdmaError::cm("rdma_resolve_route"));
        }
        drop(cm::expect_event(
            channel,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED,
            timeout,
        )?);

        let mut ctx = ConnectionContext::new(self.cm_id, &self.config, true)?;
        let wire = ctx.local_record().to_wire();
        let mut param = conn_param(&wire);
        if unsafe { rdma_connect(self.cm_id, &mut param) } != 0 {
            return Err(RdmaError::cm("rdma_connect"));
        }

        // Establishment is bounded by its own sliced wait: a peer whose HCA
        // is down can stall the blocking event retrieval for minutes.
        let event = cm::expect_event_nonblocking(
            channel,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
            timeout,
        )?;
        let peer_record = HandshakeRecord::parse(&event.private_data())?;
        drop(event);

        ctx.set_peer(peer_record);
        self.ctx = Some(ctx);
        self.peer_addr = Some(addr);
        self.local_addr = self.route_src_addr();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Passive (listen/accept) path
    // ------------------------------------------------------------------

    /// Bind to a local address without listening yet.
    pub fn bind(addr: SocketAddr, config: &RdmaConfig) -> RdmaResult<Self> {
        config.validate()?;
        let mut socket = Self::new_unbound(config.clone())?;
        if let Err(err) = socket.bind_inner(addr) {
            socket.close();
            return Err(err);
        }
        Ok(socket)
    }

    fn bind_inner(&mut self, addr: SocketAddr) -> RdmaResult<()> {
        self.apply_type_of_service()?;
        let local = socket2::SockAddr::from(addr);
        if unsafe { rdma_bind_addr(self.cm_id, local.as_ptr() as *mut libc::sockaddr) } != 0 {
            return Err(RdmaError::cm("rdma_bind_addr"));
        }
        self.local_addr = self.route_src_addr().or(Some(addr));
        Ok(())
    }

    /// Start accepting incoming connections.
    pub fn listen(&mut self) -> RdmaResult<()> {
        if unsafe { rdma_listen(self.cm_id, LISTEN_BACKLOG) } != 0 {
            return Err(RdmaError::cm("rdma_listen"));
        }
        self.listening = true;
        tracing::info!(addr = ?self.local_addr, "rdma listener ready");
        Ok(())
    }

    /// Bind and listen in one step.
    pub fn listen_on(addr: SocketAddr, config: &RdmaConfig) -> RdmaResult<Self> {
        let mut socket = Self::bind(addr, config)?;
        socket.listen()?;
        Ok(socket)
    }

    /// Take one CM event and try to turn it into a connection.
    ///
    /// Tri-state result: a connection, `Ignored` (a spurious or rejected
    /// event was consumed, call again), or an error for channel failures.
    /// Bad handshakes and local setup failures reject the request and
    /// surface as `Ignored`, never as an application error. Events queued
    /// while an earlier accept waited for establishment are drained first.
    pub fn accept(&mut self, timeout_ms: u64) -> RdmaResult<Accepted<RdmaSocket>> {
        if !self.listening {
            return Err(RdmaError::Protocol("accept on a non-listening socket".into()));
        }
        let event = match self.delayed.pop() {
            Some(event) => event,
            None => cm::wait_event(self.channel_raw()?, timeout_ms)?,
        };
        match event.kind() {
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                self.handle_connect_request(event)
            }
            kind => {
                // Late events for accepted children land here (they share
                // this channel); consuming them as "ignore" keeps the
                // accept loop alive.
                tracing::debug!(kind = event_name(kind), "ignoring cm event in accept");
                drop(event);
                Ok(Accepted::Ignored)
            }
        }
    }

    fn handle_connect_request(&mut self, event: CmEvent) -> RdmaResult<Accepted<RdmaSocket>> {
        let child_id = event.id();
        let private_data = event.private_data();
        drop(event);

        if self.config.accept_reject_rate > 0.0
            && rand::random::<f64>() < self.config.accept_reject_rate
        {
            tracing::warn!("synthetically rejecting connection request (fault injection)");
            reject_and_discard(child_id);
            return Ok(Accepted::Ignored);
        }

        let peer_record = match HandshakeRecord::parse(&private_data) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "rejecting connection request with bad handshake");
                reject_and_discard(child_id);
                return Ok(Accepted::Ignored);
            }
        };

        // The child shares this listener's event channel, so its context
        // must not watch the CM descriptor.
        let mut ctx = match ConnectionContext::new(child_id, &self.config, false) {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(%err, "rejecting connection request, local setup failed");
                reject_and_discard(child_id);
                return Ok(Accepted::Ignored);
            }
        };

        let wire = ctx.local_record().to_wire();
        let mut param = conn_param(&wire);
        if unsafe { rdma_accept(child_id, &mut param) } != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "rdma_accept failed, discarding request"
            );
            drop(ctx);
            unsafe { rdma_destroy_id(child_id) };
            return Ok(Accepted::Ignored);
        }

        // Wait for the child's establishment on the shared channel; any
        // unrelated event observed meanwhile is queued, not lost. The
        // request is discarded either way, but only a timeout is a
        // per-connection problem: a channel failure breaks the listener
        // itself and must reach the caller.
        if let Err(err) = self.wait_child_established(child_id) {
            drop(ctx);
            unsafe { rdma_destroy_id(child_id) };
            return match err {
                RdmaError::Timeout => {
                    tracing::warn!("connection request did not establish in time, discarding");
                    Ok(Accepted::Ignored)
                }
                err => {
                    tracing::error!(%err, "event channel failed while establishing a child");
                    Err(err)
                }
            };
        }

        ctx.set_peer(peer_record);
        let peer_addr = unsafe {
            sockaddr_to_std(
                &(*child_id).route.addr.__bindgen_anon_2 as *const _
                    as *const libc::sockaddr_storage,
            )
        }
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        tracing::debug!(%peer_addr, "accepted rdma connection");
        let child = RdmaSocket {
            config: self.config.clone(),
            channel: None,
            cm_id: child_id,
            ctx: Some(ctx),
            delayed: DelayedEventQueue::new(),
            err_state: false,
            listening: false,
            local_addr: self.local_addr,
            peer_addr: Some(peer_addr),
        };
        Ok(Accepted::Connection(child, peer_addr))
    }

    fn wait_child_established(&mut self, child_id: *mut rdma_cm_id) -> RdmaResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RdmaError::Timeout);
            }
            let remaining = (deadline - now).as_millis() as u64;
            let event = cm::wait_event(self.channel_raw()?, remaining)?;
            if event.kind() == rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED
                && event.id() == child_id
            {
                return Ok(());
            }
            self.delayed.push(event);
        }
    }

    /// Whether another `accept` call would find work without blocking.
    pub fn events_pending(&self) -> bool {
        if !self.delayed.is_empty() {
            return true;
        }
        match &self.channel {
            Some(channel) => poll_readable(channel.fd(), 0).unwrap_or(false),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Send the whole buffer, splitting it into ring-sized chunks.
    ///
    /// Flow control is applied before each post; completions are reclaimed
    /// in one batch only when the whole send ring is in flight. Returns the
    /// number of bytes sent, always `buf.len()` on success.
    pub fn send(&mut self, buf: &[u8]) -> RdmaResult<usize> {
        self.run(|socket| socket.send_inner(buf))
    }

    fn send_inner(&mut self, buf: &[u8]) -> RdmaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() == 1 {
            return Err(RdmaError::Protocol(
                "1-byte payloads are reserved for flow-control packets".into(),
            ));
        }

        let ctx = self.ctx_mut()?;
        let peer = *ctx.peer()?;
        let max_chunk = ctx.geometry().buf_size.min(peer.recv_buf_size as usize);

        let mut offset = 0;
        while offset < buf.len() {
            let n = data_chunk_len(buf.len() - offset, max_chunk);
            self.flow_control_on_send_wait()?;

            let ctx = self.ctx_mut()?;
            if ctx.pending_sends.count() as usize >= ctx.geometry().buf_num {
                ctx.reclaim_pending_sends()?;
            }
            let index = ctx.next_send_index();
            ctx.post_send(index, &buf[offset..offset + n])?;
            offset += n;
        }
        Ok(buf.len())
    }

    /// Receive up to `buf.len()` bytes, waiting at most `timeout_ms`.
    ///
    /// Drains the partially consumed ring buffer first and never blocks
    /// while it holds data; only an empty partial state reaches the
    /// completion engine. Control packets consumed while waiting do not
    /// count toward the caller's bytes.
    pub fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> RdmaResult<usize> {
        self.run(|socket| socket.recv_inner(buf, timeout_ms))
    }

    fn recv_inner(&mut self, buf: &mut [u8], timeout_ms: u64) -> RdmaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(n) = self.drain_partial(buf)? {
            return Ok(n);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RdmaError::Timeout);
            }
            let remaining = (deadline - now).as_millis() as u64;
            let completion = self
                .ctx_mut()?
                .wait_recv_completion(remaining)?
                .ok_or(RdmaError::Timeout)?;

            if completion.len == 1 {
                // Flow-control packet: invisible to the caller.
                self.ctx_mut()?.post_recv(completion.index)?;
                self.flow_ack_if_due()?;
                continue;
            }

            self.ctx_mut()?.partial_recv =
                Some(PartialRecv::new(completion.index, completion.len));
            let n = self.drain_partial(buf)?.unwrap_or(0);
            return Ok(n);
        }
    }

    /// Hand out bytes from the half-drained ring buffer, reposting it once
    /// empty. `None` when there is no partial receive outstanding.
    fn drain_partial(&mut self, buf: &mut [u8]) -> RdmaResult<Option<usize>> {
        let ctx = self.ctx_mut()?;
        let Some(mut partial) = ctx.partial_recv.take() else {
            return Ok(None);
        };
        let n = {
            let src = ctx.recv_chunk(partial.buf_index());
            partial.drain(src, buf)
        };
        let consumed = partial.is_consumed();
        if consumed {
            ctx.post_recv(partial.buf_index())?;
        } else {
            ctx.partial_recv = Some(partial);
        }
        if consumed {
            self.flow_ack_if_due()?;
        }
        Ok(Some(n))
    }

    /// Block until the peer proves it drained our window, when send credits
    /// are exhausted. Fast path: credits remain, return immediately.
    ///
    /// The unblocking packet may be user data; it is stashed as the partial
    /// receive. Data arriving while another partial is still outstanding
    /// has nowhere to go and is a protocol violation.
    fn flow_control_on_send_wait(&mut self) -> RdmaResult<()> {
        if !self.ctx_mut()?.flow.send_blocked() {
            return Ok(());
        }
        tracing::trace!("send credits exhausted, waiting for a packet from the peer");

        let timeout = self.config.flow_send_timeout_ms;
        let completion = self
            .ctx_mut()?
            .wait_recv_completion(timeout)?
            .ok_or(RdmaError::Timeout)?;

        if completion.len == 1 {
            self.ctx_mut()?.post_recv(completion.index)?;
            self.flow_ack_if_due()?;
            return Ok(());
        }
        let ctx = self.ctx_mut()?;
        if ctx.partial_recv.is_some() {
            return Err(RdmaError::Protocol(
                "data packet received while a partially drained buffer is outstanding".into(),
            ));
        }
        ctx.partial_recv = Some(PartialRecv::new(completion.index, completion.len));
        Ok(())
    }

    /// Send the mandatory 1-byte control packet when our receive window
    /// just closed, announcing the drained buffers to the peer.
    fn flow_ack_if_due(&mut self) -> RdmaResult<()> {
        let ctx = self.ctx_mut()?;
        if !ctx.flow.recv_ack_due() {
            return Ok(());
        }
        tracing::trace!("receive window closed, sending flow-control packet");
        if ctx.pending_sends.count() as usize >= ctx.geometry().buf_num {
            ctx.reclaim_pending_sends()?;
        }
        let index = ctx.next_send_index();
        ctx.post_send(index, &FLOW_ACK)
    }

    // ------------------------------------------------------------------
    // Liveness and teardown
    // ------------------------------------------------------------------

    /// One-word RDMA read of the peer's control region as a liveness probe.
    /// A queue pair that left its operational state, or a failed read,
    /// invalidates the socket.
    pub fn check_connection(&mut self) -> RdmaResult<()> {
        self.run(|socket| {
            let ctx = socket.ctx_mut()?;
            if !ctx.qp_operational()? {
                return Err(RdmaError::Protocol(
                    "queue pair left its operational state".into(),
                ));
            }
            // Completed sends sit in the CQ until the batch reclaim runs;
            // drain them so only the probe's completion is expected below.
            ctx.reclaim_pending_sends()?;
            ctx.post_probe_read()?;
            ctx.wait_send_completions(0, 0, 1)
        })
    }

    /// Wait for outstanding sends, then issue a one-way disconnect. Does
    /// not wait for the disconnect acknowledgment: for accepted sockets it
    /// is delivered on the listener's channel.
    pub fn shutdown(&mut self) -> RdmaResult<()> {
        if let (false, Some(ctx)) = (self.err_state, self.ctx.as_mut()) {
            ctx.reclaim_pending_sends()?;
        }
        if self.ctx.is_some() && unsafe { rdma_disconnect(self.cm_id) } != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "rdma_disconnect failed, peer may already be gone"
            );
        }
        Ok(())
    }

    /// Release everything: the delayed event queue (acknowledging queued
    /// events), the connection context, the CM identifier, and the event
    /// channel, in that order. Idempotent; safe on a never-connected handle.
    pub fn close(&mut self) {
        self.delayed.clear();
        if let Some(mut ctx) = self.ctx.take() {
            ctx.destroy();
        }
        if !self.cm_id.is_null() {
            unsafe { rdma_destroy_id(self.cm_id) };
            self.cm_id = ptr::null_mut();
        }
        self.channel = None;
        self.listening = false;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Completion-channel descriptor for external multiplexers.
    pub fn comp_channel_fd(&self) -> Option<RawFd> {
        self.ctx.as_ref().map(|ctx| ctx.comp_channel_fd())
    }

    /// CM-channel descriptor; `None` for accepted sockets, whose events
    /// arrive on the listener's channel.
    pub fn cm_channel_fd(&self) -> Option<RawFd> {
        self.channel.as_ref().map(|channel| channel.fd())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Run one operation under the sticky error flag: an already
    /// invalidated socket fails fast, and any invalidating error flips the
    /// flag before propagating.
    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> RdmaResult<T>) -> RdmaResult<T> {
        if self.err_state {
            return Err(RdmaError::Invalidated);
        }
        match f(self) {
            Err(err) if err.invalidates_socket() => {
                tracing::debug!(%err, "socket invalidated");
                self.err_state = true;
                Err(err)
            }
            result => result,
        }
    }

    fn ctx_mut(&mut self) -> RdmaResult<&mut ConnectionContext> {
        self.ctx
            .as_mut()
            .ok_or_else(|| RdmaError::Protocol("operation on an unconnected socket".into()))
    }

    fn channel_raw(&self) -> RdmaResult<*mut rdma_sys::rdma_event_channel> {
        self.channel
            .as_ref()
            .map(CmChannel::raw)
            .ok_or_else(|| RdmaError::Protocol("socket has no private event channel".into()))
    }

    fn apply_type_of_service(&mut self) -> RdmaResult<()> {
        if self.config.type_of_service == 0 {
            return Ok(());
        }
        let mut tos = self.config.type_of_service;
        let rc = unsafe {
            rdma_set_option(
                self.cm_id,
                RDMA_OPTION_ID as libc::c_int,
                RDMA_OPTION_ID_TOS as libc::c_int,
                &mut tos as *mut u8 as *mut libc::c_void,
                std::mem::size_of::<u8>(),
            )
        };
        if rc != 0 {
            return Err(RdmaError::cm("rdma_set_option(tos)"));
        }
        Ok(())
    }

    fn route_src_addr(&self) -> Option<SocketAddr> {
        if self.cm_id.is_null() {
            return None;
        }
        unsafe {
            sockaddr_to_std(
                &(*self.cm_id).route.addr.__bindgen_anon_1 as *const _
                    as *const libc::sockaddr_storage,
            )
        }
    }
}

impl Drop for RdmaSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Display for RdmaSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = if self.listening {
            "listener"
        } else if self.ctx.is_some() {
            "connection"
        } else {
            "unconnected"
        };
        write!(f, "rdma {role}")?;
        if let Some(local) = self.local_addr {
            write!(f, " local={local}")?;
        }
        if let Some(peer) = self.peer_addr {
            write!(f, " peer={peer}")?;
        }
        if self.err_state {
            write!(f, " (invalidated)")?;
        }
        Ok(())
    }
}

fn conn_param(private_data: &[u8]) -> rdma_conn_param {
    let mut param: rdma_conn_param = unsafe { MaybeUninit::zeroed().assume_init() };
    param.private_data = private_data.as_ptr() as *const libc::c_void;
    param.private_data_len = private_data.len() as u8;
    // One outstanding RDMA read each way, for the liveness probe.
    param.responder_resources = 1;
    param.initiator_depth = 1;
    param.retry_count = 7;
    param.rnr_retry_count = 7;
    param
}

fn reject_and_discard(child_id: *mut rdma_cm_id) {
    unsafe {
        if rdma_reject(child_id, ptr::null(), 0) != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "rdma_reject failed"
            );
        }
        rdma_destroy_id(child_id);
    }
}

impl Socket for RdmaSocket {
    fn send(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        Ok(RdmaSocket::send(self, buf)?)
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, NetError> {
        Ok(RdmaSocket::recv(self, buf, timeout_ms)?)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        RdmaSocket::peer_addr(self)
    }

    fn shutdown(&mut self) -> Result<(), NetError> {
        Ok(RdmaSocket::shutdown(self)?)
    }

    fn close(&mut self) {
        RdmaSocket::close(self);
    }

    fn check_connection(&mut self) -> Result<(), NetError> {
        Ok(RdmaSocket::check_connection(self)?)
    }
}

impl Listener for RdmaSocket {
    type Socket = RdmaSocket;

    fn accept(&mut self) -> Result<Accepted<RdmaSocket>, NetError> {
        let timeout = self.config.poll_timeout_ms;
        match RdmaSocket::accept(self, timeout) {
            Ok(accepted) => Ok(accepted),
            // An idle wait slice is not an event; let the loop spin.
            Err(RdmaError::Timeout) => Ok(Accepted::Ignored),
            Err(err) => Err(err.into()),
        }
    }

    fn events_pending(&self) -> bool {
        RdmaSocket::events_pending(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        RdmaSocket::local_addr(self)
    }
}

/// Factory for outbound RDMA connections, usable with the shared
/// connection registry.
#[derive(Debug, Clone, Default)]
pub struct RdmaConnector {
    config: RdmaConfig,
}

impl RdmaConnector {
    pub fn new(config: RdmaConfig) -> Self {
        Self { config }
    }
}

impl Connector for RdmaConnector {
    type Socket = RdmaSocket;

    fn connect(&self, addr: SocketAddr) -> Result<RdmaSocket, NetError> {
        Ok(RdmaSocket::connect(addr, &self.config)?)
    }
}
