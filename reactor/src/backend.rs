//! Pluggable poll backends.
//!
//! The reactor only needs a small capability set from the OS: track a set of
//! descriptors, toggle read/write interest, block until something is ready
//! and report which descriptors fired. Three implementations are provided:
//! a level-triggered `poll(2)` array, a per-fd-event backend on [`mio`] and
//! a `select(2)` fallback for platforms where neither is available.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;

/// One ready descriptor, as reported by [`Backend::check`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

pub trait Backend {
    /// Start tracking a descriptor. No interest is armed yet.
    fn add(&mut self, fd: RawFd);

    /// Stop tracking a descriptor. Must be called while the fd is still
    /// open. Unknown fds are ignored.
    fn remove(&mut self, fd: RawFd);

    fn set_read(&mut self, fd: RawFd);
    fn unset_read(&mut self, fd: RawFd);
    fn set_write(&mut self, fd: RawFd);
    fn unset_write(&mut self, fd: RawFd);

    /// Block up to `timeout` (`None` = forever) and append the ready
    /// descriptors to `ready`. Returns the number of entries appended.
    fn check(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>)
    -> io::Result<usize>;

    /// Whether a closed descriptor's bookkeeping may be reclaimed outside a
    /// dispatch pass. Array-scanning backends pin their slots.
    fn can_free(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
struct Interest {
    read: bool,
    write: bool,
}

/// Per-fd-event backend on [`mio::Poll`].
///
/// mio delivers edge-like events, so interest that survives a dispatch is
/// re-armed by re-registering; the reactor calls `set_read`/`set_write`
/// again after every handled event, which maps onto exactly that.
pub struct MioBackend {
    poll: mio::Poll,
    events: mio::Events,
    fds: HashMap<RawFd, (Interest, bool)>,
}

impl MioBackend {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            fds: HashMap::new(),
        })
    }

    fn update(&mut self, fd: RawFd) {
        let Some((interest, registered)) = self.fds.get_mut(&fd) else {
            return;
        };
        let wanted = match (interest.read, interest.write) {
            (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        };
        let registry = self.poll.registry();
        let result = match (wanted, *registered) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&fd), mio::Token(fd as usize), interest)
            }
            (Some(interest), false) => {
                *registered = true;
                registry.register(&mut SourceFd(&fd), mio::Token(fd as usize), interest)
            }
            (None, true) => {
                *registered = false;
                registry.deregister(&mut SourceFd(&fd))
            }
            (None, false) => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(fd, "poll registration failed: {e}");
        }
    }
}

impl Backend for MioBackend {
    fn add(&mut self, fd: RawFd) {
        self.fds.insert(fd, (Interest::default(), false));
    }

    fn remove(&mut self, fd: RawFd) {
        if let Some((_, registered)) = self.fds.remove(&fd)
            && registered
            && let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd))
        {
            tracing::debug!(fd, "deregister failed: {e}");
        }
    }

    fn set_read(&mut self, fd: RawFd) {
        if let Some((interest, _)) = self.fds.get_mut(&fd) {
            interest.read = true;
            self.update(fd);
        }
    }

    fn unset_read(&mut self, fd: RawFd) {
        if let Some((interest, _)) = self.fds.get_mut(&fd) {
            interest.read = false;
            self.update(fd);
        }
    }

    fn set_write(&mut self, fd: RawFd) {
        if let Some((interest, _)) = self.fds.get_mut(&fd) {
            interest.write = true;
            self.update(fd);
        }
    }

    fn unset_write(&mut self, fd: RawFd) {
        if let Some((interest, _)) = self.fds.get_mut(&fd) {
            interest.write = false;
            self.update(fd);
        }
    }

    fn check(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut n = 0;
        for event in self.events.iter() {
            ready.push(Readiness {
                fd: event.token().0 as RawFd,
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            });
            n += 1;
        }
        Ok(n)
    }

    fn can_free(&self) -> bool {
        true
    }
}

/// Level-triggered backend over a `poll(2)` array.
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn events_mut(&mut self, fd: RawFd) -> Option<&mut libc::c_short> {
        let idx = *self.index.get(&fd)?;
        Some(&mut self.fds[idx].events)
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PollBackend {
    fn add(&mut self, fd: RawFd) {
        if self.index.contains_key(&fd) {
            return;
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        });
    }

    fn remove(&mut self, fd: RawFd) {
        let Some(idx) = self.index.remove(&fd) else {
            return;
        };
        self.fds.swap_remove(idx);
        if idx < self.fds.len() {
            self.index.insert(self.fds[idx].fd, idx);
        }
    }

    fn set_read(&mut self, fd: RawFd) {
        if let Some(events) = self.events_mut(fd) {
            *events |= libc::POLLIN;
        }
    }

    fn unset_read(&mut self, fd: RawFd) {
        if let Some(events) = self.events_mut(fd) {
            *events &= !libc::POLLIN;
        }
    }

    fn set_write(&mut self, fd: RawFd) {
        if let Some(events) = self.events_mut(fd) {
            *events |= libc::POLLOUT;
        }
    }

    fn unset_write(&mut self, fd: RawFd) {
        if let Some(events) = self.events_mut(fd) {
            *events &= !libc::POLLOUT;
        }
    }

    fn check(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut n = 0;
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            ready.push(Readiness {
                fd: pfd.fd,
                readable: pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
            });
            n += 1;
        }
        Ok(n)
    }

    fn can_free(&self) -> bool {
        false
    }
}

/// `select(2)` backend. Portability fallback; descriptors must stay below
/// `FD_SETSIZE`.
pub struct SelectBackend {
    fds: HashMap<RawFd, Interest>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self {
            fds: HashMap::new(),
        }
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SelectBackend {
    fn add(&mut self, fd: RawFd) {
        if fd as usize >= libc::FD_SETSIZE {
            tracing::warn!(fd, "descriptor above FD_SETSIZE, not tracked");
            return;
        }
        self.fds.insert(fd, Interest::default());
    }

    fn remove(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    fn set_read(&mut self, fd: RawFd) {
        if let Some(interest) = self.fds.get_mut(&fd) {
            interest.read = true;
        }
    }

    fn unset_read(&mut self, fd: RawFd) {
        if let Some(interest) = self.fds.get_mut(&fd) {
            interest.read = false;
        }
    }

    fn set_write(&mut self, fd: RawFd) {
        if let Some(interest) = self.fds.get_mut(&fd) {
            interest.write = true;
        }
    }

    fn unset_write(&mut self, fd: RawFd) {
        if let Some(interest) = self.fds.get_mut(&fd) {
            interest.write = false;
        }
    }

    fn check(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<Readiness>,
    ) -> io::Result<usize> {
        let mut read_set = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut write_set = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
        }

        let mut nfds = 0;
        for (fd, interest) in &self.fds {
            if interest.read {
                unsafe { libc::FD_SET(*fd, &mut read_set) };
            }
            if interest.write {
                unsafe { libc::FD_SET(*fd, &mut write_set) };
            }
            if (interest.read || interest.write) && *fd >= nfds {
                nfds = *fd + 1;
            }
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = match tv.as_mut() {
            Some(tv) => tv as *mut libc::timeval,
            None => std::ptr::null_mut(),
        };

        let rc = unsafe {
            libc::select(
                nfds,
                &mut read_set,
                &mut write_set,
                std::ptr::null_mut(),
                tv_ptr,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut n = 0;
        for fd in self.fds.keys() {
            let readable = unsafe { libc::FD_ISSET(*fd, &read_set) };
            let writable = unsafe { libc::FD_ISSET(*fd, &write_set) };
            if readable || writable {
                ready.push(Readiness {
                    fd: *fd,
                    readable,
                    writable,
                });
                n += 1;
            }
        }
        Ok(n)
    }

    fn can_free(&self) -> bool {
        false
    }
}
