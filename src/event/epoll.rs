//! epoll(7) readiness backend (Linux)

use super::{Mask, READABLE, WRITABLE};
use std::io;
use std::os::unix::io::RawFd;

pub const BACKEND_NAME: &str = "epoll";

pub struct Backend {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Backend {
    pub fn new(setsize: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; setsize.max(16)],
        })
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: Mask) -> io::Result<()> {
        let mut events = 0u32;
        if mask & READABLE != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if mask & WRITABLE != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register interest; `old_mask` is what was registered before.
    pub fn add(&mut self, fd: RawFd, old_mask: Mask, added: Mask) -> io::Result<()> {
        let merged = old_mask | added;
        let op = if old_mask == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, merged)
    }

    /// Drop interest bits; removes the fd entirely when nothing is left.
    pub fn del(&mut self, fd: RawFd, old_mask: Mask, removed: Mask) {
        let remaining = old_mask & !removed;
        let _ = if remaining == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, remaining)
        };
    }

    /// Block until readiness or timeout. `None` blocks indefinitely.
    pub fn poll(&mut self, timeout_ms: Option<u64>) -> Vec<(RawFd, Mask)> {
        let timeout = match timeout_ms {
            Some(ms) => ms.min(i32::MAX as u64) as i32,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout,
            )
        };
        let mut fired = Vec::new();
        if n <= 0 {
            return fired;
        }
        for ev in &self.events[..n as usize] {
            let mut mask = 0;
            if ev.events & libc::EPOLLIN as u32 != 0 {
                mask |= READABLE;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                mask |= WRITABLE;
            }
            if ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                // Let the handlers observe the failure and clean up.
                mask |= READABLE | WRITABLE;
            }
            fired.push((ev.u64 as RawFd, mask));
        }
        fired
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
