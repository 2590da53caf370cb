//! poll(2) readiness backend (portable Unix fallback)

use super::{Mask, READABLE, WRITABLE};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

pub const BACKEND_NAME: &str = "poll";

pub struct Backend {
    interest: HashMap<RawFd, Mask>,
}

impl Backend {
    pub fn new(_setsize: usize) -> io::Result<Self> {
        Ok(Self { interest: HashMap::new() })
    }

    pub fn add(&mut self, fd: RawFd, old_mask: Mask, added: Mask) -> io::Result<()> {
        self.interest.insert(fd, old_mask | added);
        Ok(())
    }

    pub fn del(&mut self, fd: RawFd, old_mask: Mask, removed: Mask) {
        let remaining = old_mask & !removed;
        if remaining == 0 {
            self.interest.remove(&fd);
        } else {
            self.interest.insert(fd, remaining);
        }
    }

    pub fn poll(&mut self, timeout_ms: Option<u64>) -> Vec<(RawFd, Mask)> {
        let mut fds: Vec<libc::pollfd> = self
            .interest
            .iter()
            .map(|(&fd, &mask)| {
                let mut events = 0i16;
                if mask & READABLE != 0 {
                    events |= libc::POLLIN;
                }
                if mask & WRITABLE != 0 {
                    events |= libc::POLLOUT;
                }
                libc::pollfd { fd, events, revents: 0 }
            })
            .collect();
        let timeout = match timeout_ms {
            Some(ms) => ms.min(i32::MAX as u64) as i32,
            None => -1,
        };
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        let mut fired = Vec::new();
        if n <= 0 {
            return fired;
        }
        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            let mut mask = 0;
            if pfd.revents & libc::POLLIN != 0 {
                mask |= READABLE;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                mask |= WRITABLE;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                mask |= READABLE | WRITABLE;
            }
            fired.push((pfd.fd, mask));
        }
        fired
    }
}
