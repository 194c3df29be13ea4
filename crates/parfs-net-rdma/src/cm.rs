//! Connection-manager plumbing: event channels, owned events, and the
//! delayed-event queue used on the accept path.
//!
//! Every event taken from a channel must be acknowledged back to the CM, and
//! an unacknowledged event blocks identifier destruction. Events are
//! therefore wrapped in an owning type that acknowledges on drop; anything a
//! caller needs from an event (type, ids, private data) is copied out first.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::ptr;

use rdma_sys::{
    rdma_ack_cm_event, rdma_cm_event, rdma_cm_event_type, rdma_cm_id, rdma_create_event_channel,
    rdma_destroy_event_channel, rdma_event_channel, rdma_get_cm_event,
};

use crate::error::{RdmaError, RdmaResult};
use crate::verbs::poll_readable;

pub(crate) fn channel_fd(channel: *mut rdma_event_channel) -> RawFd {
    unsafe { (*channel).fd }
}

/// Human-readable name for the event types this transport handles.
pub(crate) fn event_name(kind: rdma_cm_event_type::Type) -> &'static str {
    match kind {
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => "ADDR_RESOLVED",
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => "ADDR_ERROR",
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => "ROUTE_RESOLVED",
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => "ROUTE_ERROR",
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => "CONNECT_REQUEST",
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => "CONNECT_ERROR",
        rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => "UNREACHABLE",
        rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => "REJECTED",
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => "ESTABLISHED",
        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => "DISCONNECTED",
        rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => "DEVICE_REMOVAL",
        rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => "TIMEWAIT_EXIT",
        _ => "OTHER",
    }
}

/// An owned CM event channel.
pub(crate) struct CmChannel {
    raw: *mut rdma_event_channel,
}

// The channel is owned by exactly one socket.
unsafe impl Send for CmChannel {}

impl CmChannel {
    pub(crate) fn new() -> RdmaResult<Self> {
        let raw = unsafe { rdma_create_event_channel() };
        if raw.is_null() {
            return Err(RdmaError::cm("rdma_create_event_channel"));
        }
        Ok(Self { raw })
    }

    pub(crate) fn raw(&self) -> *mut rdma_event_channel {
        self.raw
    }

    pub(crate) fn fd(&self) -> RawFd {
        channel_fd(self.raw)
    }
}

impl Drop for CmChannel {
    fn drop(&mut self) {
        unsafe { rdma_destroy_event_channel(self.raw) };
    }
}

/// One CM event, acknowledged on drop.
pub(crate) struct CmEvent {
    raw: *mut rdma_cm_event,
}

unsafe impl Send for CmEvent {}

impl CmEvent {
    pub(crate) fn kind(&self) -> rdma_cm_event_type::Type {
        unsafe { (*self.raw).event }
    }

    pub(crate) fn status(&self) -> libc::c_int {
        unsafe { (*self.raw).status }
    }

    /// The identifier this event refers to: the new child id for a
    /// connection request, the connection's own id otherwise.
    pub(crate) fn id(&self) -> *mut rdma_cm_id {
        unsafe { (*self.raw).id }
    }

    /// The peer's connect/accept private data, copied out so it survives
    /// the acknowledgment.
    pub(crate) fn private_data(&self) -> Vec<u8> {
        let data = unsafe { (*self.raw).param.conn.private_data };
        let len = unsafe { (*self.raw).param.conn.private_data_len } as usize;
        if data.is_null() || len == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(data as *const u8, len) }.to_vec()
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        let rc = unsafe { rdma_ack_cm_event(self.raw) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "rdma_ack_cm_event failed"
            );
        }
    }
}

/// Take the next event off a channel. Blocks unless the channel fd is
/// non-blocking or known readable.
pub(crate) fn take_event(channel: *mut rdma_event_channel) -> RdmaResult<CmEvent> {
    let mut raw: *mut rdma_cm_event = ptr::null_mut();
    if unsafe { rdma_get_cm_event(channel, &mut raw) } != 0 {
        return Err(RdmaError::cm("rdma_get_cm_event"));
    }
    Ok(CmEvent { raw })
}

/// Wait up to `timeout_ms` for the next event.
pub(crate) fn wait_event(channel: *mut rdma_event_channel, timeout_ms: u64) -> RdmaResult<CmEvent> {
    if !poll_readable(channel_fd(channel), timeout_ms)? {
        return Err(RdmaError::Timeout);
    }
    take_event(channel)
}

/// Wait for one specific event type, treating anything else as fatal for
/// the operation in progress. Used on the strictly sequential connect path
/// where no unrelated events can be interleaved.
pub(crate) fn expect_event(
    channel: *mut rdma_event_channel,
    expected: rdma_cm_event_type::Type,
    timeout_ms: u64,
) -> RdmaResult<CmEvent> {
    let event = wait_event(channel, timeout_ms)?;
    check_expected(event, expected)
}

/// Longest stretch the establishment wait spends inside one poll before
/// re-checking its deadline.
const CONNECT_POLL_SLICE_MS: u64 = 500;

/// Like [`expect_event`], but with the channel switched to non-blocking and
/// polled in bounded slices, restored to blocking regardless of outcome.
/// The blocking event retrieval can otherwise stall for minutes when the
/// peer's HCA is down mid-handshake.
pub(crate) fn expect_event_nonblocking(
    channel: *mut rdma_event_channel,
    expected: rdma_cm_event_type::Type,
    timeout_ms: u64,
) -> RdmaResult<CmEvent> {
    let fd = channel_fd(channel);
    let _restore = NonblockingGuard::set(fd)?;

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            return Err(RdmaError::Timeout);
        }
        let remaining = (deadline - now).as_millis() as u64;
        if !poll_readable(fd, remaining.min(CONNECT_POLL_SLICE_MS))? {
            continue;
        }
        let mut raw: *mut rdma_cm_event = ptr::null_mut();
        if unsafe { rdma_get_cm_event(channel, &mut raw) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(RdmaError::Cm {
                op: "rdma_get_cm_event",
                source: err,
            });
        }
        return check_expected(CmEvent { raw }, expected);
    }
}

fn check_expected(event: CmEvent, expected: rdma_cm_event_type::Type) -> RdmaResult<CmEvent> {
    let kind = event.kind();
    if kind == expected {
        return Ok(event);
    }
    let status = event.status();
    drop(event);
    match kind {
        rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => Err(RdmaError::Rejected),
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR
        | rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR
        | rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
        | rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => Err(RdmaError::Cm {
            op: "rdma cm event",
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} (status {status})", event_name(kind)),
            ),
        }),
        other => Err(RdmaError::Protocol(format!(
            "expected cm event {}, got {} (status {status})",
            event_name(expected),
            event_name(other)
        ))),
    }
}

/// Puts a descriptor into non-blocking mode and restores the original flags
/// when dropped, on every exit path.
struct NonblockingGuard {
    fd: RawFd,
    saved_flags: libc::c_int,
}

impl NonblockingGuard {
    fn set(fd: RawFd) -> RdmaResult<Self> {
        let saved_flags = crate::verbs::set_nonblocking(fd, true)?;
        Ok(Self { fd, saved_flags })
    }
}

impl Drop for NonblockingGuard {
    fn drop(&mut self) {
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, self.saved_flags) };
        if rc < 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to restore event-channel flags"
            );
        }
    }
}

/// Events that arrived while the accept path was waiting for a specific
/// child event. They are replayed to the next `accept` call in arrival
/// order; dropping the queue acknowledges whatever was never replayed.
#[derive(Default)]
pub(crate) struct DelayedEventQueue {
    events: VecDeque<CmEvent>,
}

impl DelayedEventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, event: CmEvent) {
        tracing::debug!(kind = event_name(event.kind()), "queueing delayed cm event");
        self.events.push_back(event);
    }

    pub(crate) fn pop(&mut self) -> Option<CmEvent> {
        self.events.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}
