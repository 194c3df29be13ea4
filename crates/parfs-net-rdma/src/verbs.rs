//! OS-level plumbing for the verbs transport: epoll, non-blocking fds, and
//! sockaddr conversions.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::{RdmaError, RdmaResult};

/// Readiness multiplexer over the completion channel and CM channel fds.
///
/// Created only for connected, non-listening handles. Tokens identify which
/// descriptor woke us.
pub(crate) struct Epoll {
    fd: RawFd,
}

pub(crate) const EP_TOKEN_COMP: u64 = 1;
pub(crate) const EP_TOKEN_CM: u64 = 2;

impl Epoll {
    pub(crate) fn new() -> RdmaResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(RdmaError::verbs("epoll_create1"));
        }
        Ok(Self { fd })
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64) -> RdmaResult<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(RdmaError::verbs("epoll_ctl"));
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for one descriptor to become readable.
    /// Returns its token, or `None` on timeout.
    pub(crate) fn wait(&self, timeout_ms: u64) -> RdmaResult<Option<u64>> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        loop {
            let rc = unsafe { libc::epoll_wait(self.fd, &mut event, 1, timeout) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RdmaError::Verbs {
                    op: "epoll_wait",
                    source: err,
                });
            }
            if rc == 0 {
                return Ok(None);
            }
            return Ok(Some(event.u64));
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Toggle `O_NONBLOCK` on a descriptor, returning the previous flags so the
/// caller can restore them.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> RdmaResult<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(RdmaError::verbs("fcntl(F_GETFL)"));
    }
    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if new_flags != flags {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
        if rc < 0 {
            return Err(RdmaError::verbs("fcntl(F_SETFL)"));
        }
    }
    Ok(flags)
}

/// One-shot readability poll with a bounded wait.
pub(crate) fn poll_readable(fd: RawFd, timeout_ms: u64) -> RdmaResult<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = timeout_ms.min(i32::MAX as u64) as i32;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(RdmaError::Verbs {
                op: "poll",
                source: err,
            });
        }
        return Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0);
    }
}

/// Decode a sockaddr captured from a CM identifier's route.
///
/// # Safety
/// `storage` must point to a valid, initialized sockaddr of the family its
/// `ss_family` claims.
pub(crate) unsafe fn sockaddr_to_std(storage: *const libc::sockaddr_storage) -> Option<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}
