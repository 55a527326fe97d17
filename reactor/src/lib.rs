//! Managed I/O: a single-threaded reactor that multiplexes non-blocking
//! sockets and drives the application through a [`Handler`].
//!
//! The reactor owns every descriptor it manages. Listeners, outbound
//! connects and adopted descriptors are registered with a [`Token`] that the
//! application maps back to its own state when an event fires. Two timeout
//! queues are serviced from the same loop: *immediate* timeouts run at the
//! start of the next [`Reactor::run`] pass, *timed* timeouts when their
//! deadline elapses.
//!
//! Polling is pluggable via [`Backend`]: a level-triggered `poll(2)` array,
//! a per-fd-event backend on top of [`mio`], and a `select(2)` fallback for
//! portability.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod backend;
mod net;
mod timer;

pub use backend::{Backend, MioBackend, PollBackend, Readiness, SelectBackend};
pub use net::{recv, recv_from, send, send_to};
pub use timer::TimeoutId;

use std::io;
use std::mem::ManuallyDrop;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use timer::Timers;

/// A descriptor managed by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(RawFd);

impl Fd {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Application-defined context attached to a descriptor or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Return value of [`Handler::on_immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Abort the current [`Reactor::run`] pass; the application is tearing
    /// down.
    Stop,
}

/// The application side of the reactor.
///
/// All callbacks execute inline on the reactor thread and receive the
/// reactor itself, so they may arm interest, connect, close or schedule
/// timeouts while handling an event.
pub trait Handler {
    /// The descriptor is readable. Return `true` to keep read interest
    /// armed, `false` to unset it.
    fn on_read(&mut self, m: &mut Reactor, fd: Fd, token: Token) -> bool;

    /// The descriptor is writable (or [`Reactor::write`] probes for more to
    /// write). Return `true` to keep write interest armed.
    fn on_write(&mut self, m: &mut Reactor, fd: Fd, token: Token) -> bool;

    /// A listener accepted `fd` from `peer`. Return `false` to reject: the
    /// reactor closes the accepted socket again. The new descriptor starts
    /// with the listener's token; use [`Reactor::set_token`] to claim it.
    fn on_accept(&mut self, m: &mut Reactor, fd: Fd, token: Token, peer: SocketAddr) -> bool;

    /// The descriptor is going away. Flush and free any per-fd state; the
    /// OS socket is closed when this returns.
    fn on_close(&mut self, m: &mut Reactor, fd: Fd, token: Token);

    /// A timed timeout elapsed (or was fired early).
    fn on_timeout(&mut self, m: &mut Reactor, token: Token);

    /// An immediate timeout, run at the start of the next pass.
    fn on_immediate(&mut self, m: &mut Reactor, token: Token) -> Control;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("descriptor {0} outside the managed range")]
    OutOfRange(RawFd),
    #[error("descriptor {0} is already managed")]
    Occupied(RawFd),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdKind {
    Closed,
    Normal,
    Listen,
    /// TCP connect in flight; the flags record read/write intent the
    /// application registered before the connect completed.
    Connect { read: bool, write: bool },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    kind: FdKind,
    token: Token,
}

/// The reactor. One per thread; never shared.
pub struct Reactor {
    maxfd: usize,
    slots: Vec<Option<Slot>>,
    backend: Box<dyn Backend>,
    timers: Timers,
    in_dispatch: bool,
    deferred_free: Vec<RawFd>,
    ready_buf: Vec<Readiness>,
}

impl Reactor {
    /// A reactor on the default (mio) backend.
    pub fn new(maxfd: usize) -> io::Result<Self> {
        Ok(Self::with_backend(maxfd, Box::new(MioBackend::new()?)))
    }

    pub fn with_backend(maxfd: usize, backend: Box<dyn Backend>) -> Self {
        Self {
            maxfd,
            slots: Vec::new(),
            backend,
            timers: Timers::new(),
            in_dispatch: false,
            deferred_free: Vec::new(),
            ready_buf: Vec::new(),
        }
    }

    /// Bind a listening socket and start accepting.
    pub fn listen(&mut self, port: u16, bind_ip: IpAddr, token: Token) -> Result<Fd, Error> {
        let addr = SocketAddr::new(bind_ip, port);
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(10)?;
        sock.set_nonblocking(true)?;

        let raw = sock.into_raw_fd();
        let fd = match self.alloc(raw, FdKind::Listen, token) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(raw) };
                return Err(e);
            }
        };
        tracing::debug!(%fd, port, "listening");
        self.read(fd);
        Ok(fd)
    }

    /// Start a non-blocking TCP connect to `dst`, optionally binding the
    /// local side to `src_ip` first.
    pub fn connect(
        &mut self,
        dst: SocketAddr,
        src_ip: Option<IpAddr>,
        token: Token,
    ) -> Result<Fd, Error> {
        let sock = Socket::new(Domain::for_address(dst), Type::STREAM, None)?;
        if let Some(ip) = src_ip {
            sock.bind(&SocketAddr::new(ip, 0).into())?;
        }
        sock.set_nonblocking(true)?;

        match sock.connect(&dst.into()) {
            Ok(()) => {
                // Completed synchronously (loopback, mostly).
                let raw = sock.into_raw_fd();
                let fd = self.alloc_or_close(raw, FdKind::Normal, token)?;
                tracing::debug!(%fd, %dst, "connected");
                Ok(fd)
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                let raw = sock.into_raw_fd();
                let fd = self.alloc_or_close(
                    raw,
                    FdKind::Connect {
                        read: false,
                        write: false,
                    },
                    token,
                )?;
                // Write readiness signals that the connect finished.
                self.backend.set_write(raw);
                tracing::debug!(%fd, %dst, "connect in progress");
                Ok(fd)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Adopt an externally created descriptor (e.g. the resolver's UDP
    /// socket). The reactor takes ownership and switches it to
    /// non-blocking.
    pub fn setup_fd(&mut self, raw: RawFd, token: Token) -> Result<Fd, Error> {
        if let Err(e) = net::set_nonblocking(raw) {
            unsafe { libc::close(raw) };
            return Err(e.into());
        }
        self.alloc_or_close(raw, FdKind::Normal, token)
    }

    /// Replace the token attached to a descriptor.
    pub fn set_token(&mut self, fd: Fd, token: Token) {
        if let Some(slot) = self.slot_mut(fd) {
            slot.token = token;
        }
    }

    /// Arm read interest. On a connecting descriptor the intent is recorded
    /// and replayed when the connect completes.
    pub fn read(&mut self, fd: Fd) {
        match self.kind(fd) {
            Some(FdKind::Connect { write, .. }) => {
                if let Some(slot) = self.slot_mut(fd) {
                    slot.kind = FdKind::Connect { read: true, write };
                }
            }
            Some(FdKind::Normal | FdKind::Listen) => self.backend.set_read(fd.raw()),
            Some(FdKind::Closed) | None => {}
        }
    }

    /// Try writing via the application right away; arm write interest only
    /// if the handler reports more to write. On a connecting descriptor the
    /// intent is recorded and replayed when the connect completes.
    pub fn write<H: Handler>(&mut self, app: &mut H, fd: Fd) {
        let Some(slot) = self.slot(fd) else {
            return;
        };
        let token = slot.token;
        match slot.kind {
            FdKind::Connect { read, .. } => {
                if let Some(slot) = self.slot_mut(fd) {
                    slot.kind = FdKind::Connect { read, write: true };
                }
                return;
            }
            FdKind::Normal => {}
            FdKind::Listen | FdKind::Closed => return,
        }
        if app.on_write(self, fd, token) {
            self.backend.set_write(fd.raw());
        }
    }

    /// Close a descriptor. Idempotent: the handler's `on_close` runs once,
    /// then the OS socket is closed. Slot reclamation may be deferred until
    /// the end of the current dispatch pass.
    pub fn close<H: Handler>(&mut self, app: &mut H, fd: Fd) {
        let Some(slot) = self.slot_mut(fd) else {
            return;
        };
        if slot.kind == FdKind::Closed {
            return;
        }
        let token = slot.token;
        slot.kind = FdKind::Closed;
        tracing::debug!(%fd, "closing");

        self.backend.remove(fd.raw());
        app.on_close(self, fd, token);
        unsafe { libc::close(fd.raw()) };

        if self.in_dispatch || !self.backend.can_free() {
            self.deferred_free.push(fd.raw());
        } else {
            self.free_slot(fd.raw());
        }
    }

    /// Run one pass of the loop: immediate timeouts, poll (bounded by
    /// `timeout` and the earliest timed deadline), event dispatch, timed
    /// timeouts.
    pub fn run<H: Handler>(&mut self, app: &mut H, timeout: Option<Duration>) -> io::Result<()> {
        while let Some(token) = self.timers.pop_immediate() {
            if app.on_immediate(self, token) == Control::Stop {
                return Ok(());
            }
        }

        self.timers.rebase(Instant::now());
        let timeout = self.timers.clamp_poll_timeout(timeout, Instant::now());

        let mut ready = std::mem::take(&mut self.ready_buf);
        ready.clear();
        match self.backend.check(timeout, &mut ready) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.ready_buf = ready;
                self.fire_timed(app);
                return Ok(());
            }
            Err(e) => {
                self.ready_buf = ready;
                self.fire_timed(app);
                return Err(e);
            }
        }

        self.in_dispatch = true;
        for r in &ready {
            let fd = Fd(r.fd);
            let Some(slot) = self.slot(fd) else {
                continue;
            };
            let token = slot.token;
            match slot.kind {
                FdKind::Closed => continue,
                FdKind::Listen => {
                    if r.readable {
                        self.do_accept(app, fd, token);
                        // Level-triggered backends re-report a non-empty
                        // accept queue; re-arm for the per-fd-event one.
                        if self.kind(fd) == Some(FdKind::Listen) {
                            self.backend.set_read(fd.raw());
                        }
                    }
                }
                FdKind::Connect { .. } => {
                    if r.readable || r.writable {
                        self.finish_connect(app, fd);
                    }
                }
                FdKind::Normal => {
                    if r.readable {
                        if app.on_read(self, fd, token) {
                            self.backend.set_read(fd.raw());
                        } else {
                            self.backend.unset_read(fd.raw());
                        }
                    }
                    // The read handler may have closed or retagged the fd.
                    if r.writable && self.kind(fd) == Some(FdKind::Normal) {
                        let token = match self.slot(fd) {
                            Some(slot) => slot.token,
                            None => continue,
                        };
                        if app.on_write(self, fd, token) {
                            self.backend.set_write(fd.raw());
                        } else {
                            self.backend.unset_write(fd.raw());
                        }
                    }
                }
            }
        }
        self.in_dispatch = false;
        for raw in std::mem::take(&mut self.deferred_free) {
            self.free_slot(raw);
        }
        self.ready_buf = ready;

        self.fire_timed(app);
        Ok(())
    }

    /// Schedule a timeout for the start of the next pass.
    pub fn add_immediate(&mut self, token: Token) -> TimeoutId {
        self.timers.add_immediate(token)
    }

    pub fn cancel_immediate(&mut self, id: TimeoutId) {
        self.timers.cancel_immediate(id);
    }

    /// Schedule a timeout `delay` from now.
    pub fn add_timeout(&mut self, token: Token, delay: Duration) -> TimeoutId {
        self.timers.add_timeout(token, delay, Instant::now())
    }

    pub fn cancel_timeout(&mut self, id: TimeoutId) {
        self.timers.cancel_timeout(id);
    }

    /// Fire a pending timed timeout synchronously and remove it. Returns
    /// `false` if the id is not pending (elapsed or cancelled).
    pub fn run_timeout_early<H: Handler>(&mut self, app: &mut H, id: TimeoutId) -> bool {
        match self.timers.remove_timeout(id) {
            Some(token) => {
                app.on_timeout(self, token);
                true
            }
            None => false,
        }
    }

    fn fire_timed<H: Handler>(&mut self, app: &mut H) {
        while let Some(token) = self.timers.pop_elapsed(Instant::now()) {
            app.on_timeout(self, token);
        }
    }

    fn do_accept<H: Handler>(&mut self, app: &mut H, fd: Fd, token: Token) {
        // One accept per readiness event.
        let listener = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd.raw()) });
        let (sock, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let Some(peer) = addr.as_socket() else {
            return;
        };
        if sock.set_nonblocking(true).is_err() {
            return;
        }

        let raw = sock.into_raw_fd();
        let new_fd = match self.alloc(raw, FdKind::Normal, token) {
            Ok(new_fd) => new_fd,
            Err(_) => {
                unsafe { libc::close(raw) };
                return;
            }
        };
        tracing::debug!(fd = %new_fd, %peer, "accepted");

        if !app.on_accept(self, new_fd, token, peer) {
            tracing::debug!(fd = %new_fd, %peer, "accept rejected");
            self.backend.remove(raw);
            unsafe { libc::close(raw) };
            self.free_slot(raw);
        }
    }

    fn finish_connect<H: Handler>(&mut self, app: &mut H, fd: Fd) {
        let Some(slot) = self.slot_mut(fd) else {
            return;
        };
        let FdKind::Connect { read, write } = slot.kind else {
            return;
        };
        tracing::debug!(%fd, "connect finished");

        slot.kind = FdKind::Normal;
        self.backend.unset_write(fd.raw());

        if read {
            self.read(fd);
        }
        if write {
            self.write(app, fd);
        }
    }

    fn alloc(&mut self, raw: RawFd, kind: FdKind, token: Token) -> Result<Fd, Error> {
        if raw < 0 || raw as usize >= self.maxfd {
            return Err(Error::OutOfRange(raw));
        }
        let idx = raw as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        match self.slots[idx] {
            Some(slot) if slot.kind != FdKind::Closed => return Err(Error::Occupied(raw)),
            _ => {}
        }
        // The OS reused a number whose slot is awaiting deferred free.
        self.deferred_free.retain(|f| *f != raw);
        self.slots[idx] = Some(Slot { kind, token });
        self.backend.add(raw);
        Ok(Fd(raw))
    }

    fn alloc_or_close(&mut self, raw: RawFd, kind: FdKind, token: Token) -> Result<Fd, Error> {
        self.alloc(raw, kind, token).map_err(|e| {
            unsafe { libc::close(raw) };
            e
        })
    }

    fn free_slot(&mut self, raw: RawFd) {
        if let Some(slot) = self.slots.get_mut(raw as usize) {
            *slot = None;
        }
    }

    fn slot(&self, fd: Fd) -> Option<Slot> {
        *self.slots.get(fd.raw() as usize)?
    }

    fn slot_mut(&mut self, fd: Fd) -> Option<&mut Slot> {
        self.slots.get_mut(fd.raw() as usize)?.as_mut()
    }

    fn kind(&self, fd: Fd) -> Option<FdKind> {
        self.slot(fd).map(|s| s.kind)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot
                && slot.kind != FdKind::Closed
            {
                unsafe { libc::close(idx as RawFd) };
            }
        }
    }
}
