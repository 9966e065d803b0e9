//! Event integration: descriptors, event masks, `service`, and the
//! happy-eyeballs connect race

use super::{ConnectionState, Context};
use crate::error::{Error, Result};
use crate::transport::{poll, tcp};
use bitflags::bitflags;
use socket2::Socket;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay before the next candidate address joins the race
pub const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(100);

bitflags! {
    /// poll(2) event bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: i16 {
        const READ = libc::POLLIN;
        const WRITE = libc::POLLOUT;
        const ERROR = libc::POLLERR;
        const HANGUP = libc::POLLHUP;
    }
}

/// What happened to a descriptor, for external reactors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFd {
    Add,
    Del,
}

pub type ChangeFdCallback = Box<dyn FnMut(RawFd, ChangeFd)>;
pub type ChangeEventsCallback = Box<dyn FnMut(RawFd, Events)>;
/// Completion of the socket connect
pub type ConnectCallback = Box<dyn FnOnce(&mut Context, Result<()>)>;

#[derive(Default)]
pub(crate) struct Notifier {
    change_fd: Option<ChangeFdCallback>,
    change_events: Option<ChangeEventsCallback>,
    fds: Vec<RawFd>,
    events: Events,
}

struct Candidate {
    socket: Socket,
    addr: SocketAddr,
}

/// Connect attempts racing across the resolved addresses
pub(crate) struct HappyEyeballs {
    waiting: VecDeque<SocketAddr>,
    candidates: Vec<Candidate>,
    last_start: Instant,
    last_error: Option<io::Error>,
    callback: Option<ConnectCallback>,
}

impl Context {
    /// Start connecting to `server` (`host`, `host:port`, `[v6]:port`).
    ///
    /// The callback fires once, from `service`, when one address has
    /// connected or all of them have failed.
    pub fn connect_async(
        &mut self,
        server: &str,
        callback: impl FnOnce(&mut Context, Result<()>) + 'static,
    ) -> Result<()> {
        if self.socket.is_some() || self.connecting.is_some() {
            return Err(Error::InvalidState("already connected".into()));
        }
        let addrs = tcp::resolve(server)?;
        info!(server, candidates = addrs.len(), "connecting");
        self.connecting = Some(HappyEyeballs {
            waiting: addrs.into(),
            candidates: Vec::new(),
            last_start: Instant::now(),
            last_error: None,
            callback: Some(Box::new(callback)),
        });
        self.set_state(ConnectionState::Connecting);
        if !self.start_next_candidate() {
            let err = self.take_connect_error();
            self.connecting = None;
            self.set_state(ConnectionState::Disconnected);
            self.set_error(format!("connect to {} failed: {}", server, err));
            return Err(err);
        }
        self.update_notifications();
        Ok(())
    }

    /// Launch connects until one is in flight. False when no address is
    /// left to try.
    fn start_next_candidate(&mut self) -> bool {
        let Some(he) = self.connecting.as_mut() else {
            return false;
        };
        while let Some(addr) = he.waiting.pop_front() {
            he.last_start = Instant::now();
            match tcp::start_connect(addr) {
                Ok(socket) => {
                    debug!(%addr, "connect attempt started");
                    he.candidates.push(Candidate { socket, addr });
                    return true;
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connect attempt failed");
                    he.last_error = Some(e);
                }
            }
        }
        false
    }

    fn take_connect_error(&mut self) -> Error {
        self.connecting
            .as_mut()
            .and_then(|he| he.last_error.take())
            .map(Error::Io)
            .unwrap_or_else(|| Error::Io(io::ErrorKind::ConnectionRefused.into()))
    }

    fn finish_connect(&mut self, result: Result<()>) {
        let callback = self.connecting.take().and_then(|mut he| he.callback.take());
        match &result {
            Ok(()) => self.set_state(ConnectionState::Negotiating),
            Err(e) => {
                self.set_error(format!("socket connect failed: {}", e));
                self.set_state(ConnectionState::Disconnected);
            }
        }
        self.update_notifications();
        if let Some(cb) = callback {
            cb(self, result);
        }
    }

    /// The descriptor to poll: the socket, or the first candidate while
    /// connecting.
    pub fn fd(&self) -> Option<RawFd> {
        if let Some(socket) = &self.socket {
            return Some(socket.as_raw_fd());
        }
        self.connecting
            .as_ref()
            .and_then(|he| he.candidates.first())
            .map(|c| c.socket.as_raw_fd())
    }

    /// Every descriptor to poll, and the poll timeout in milliseconds the
    /// caller should use (-1 for none). While connecting, an expired
    /// timeout must be reported with `service_fd(-1, Events::empty())`.
    pub fn get_fds(&self) -> (Vec<RawFd>, i32) {
        if let Some(he) = &self.connecting {
            let fds = he.candidates.iter().map(|c| c.socket.as_raw_fd()).collect();
            let timeout = if he.waiting.is_empty() {
                -1
            } else {
                HAPPY_EYEBALLS_DELAY.as_millis() as i32
            };
            return (fds, timeout);
        }
        match &self.socket {
            Some(socket) => (
                vec![socket.as_raw_fd()],
                if self.config.timeout.is_some() { 1000 } else { -1 },
            ),
            None => (Vec::new(), -1),
        }
    }

    /// Events the caller should wait for on [`Context::fd`].
    pub fn which_events(&self) -> Events {
        if self.connecting.is_some() {
            return Events::WRITE;
        }
        if self.socket.is_none() {
            return Events::empty();
        }
        if self.head_sendable() {
            Events::READ | Events::WRITE
        } else {
            Events::READ
        }
    }

    /// Service the descriptor returned by [`Context::fd`].
    pub fn service(&mut self, revents: Events) -> Result<()> {
        match self.fd() {
            Some(fd) => self.service_fd(fd, revents),
            None => Err(Error::NotConnected),
        }
    }

    /// Service one descriptor. `fd == -1` is the timer tick: it runs the
    /// timeout sweep and, while connecting, starts the next candidate.
    ///
    /// An `Err` means the connection failed; every outstanding command has
    /// already been completed with a reset.
    pub fn service_fd(&mut self, fd: RawFd, revents: Events) -> Result<()> {
        if self.connecting.is_some() {
            self.service_connecting(fd, revents);
            return Ok(());
        }
        if fd == -1 {
            self.timeout_sweep();
            self.update_notifications();
            return Ok(());
        }
        match self.socket.as_ref().map(|s| s.as_raw_fd()) {
            Some(own) if own == fd => {}
            Some(_) => {
                return Err(Error::InvalidParameter(format!(
                    "fd {} does not belong to this connection",
                    fd
                )))
            }
            None => return Err(Error::NotConnected),
        }
        let result = self.service_socket(revents);
        if let Err(e) = &result {
            self.fatal(e);
        }
        self.timeout_sweep();
        self.update_notifications();
        result
    }

    fn service_socket(&mut self, revents: Events) -> Result<()> {
        if revents.intersects(Events::ERROR | Events::HANGUP) && !revents.contains(Events::READ)
        {
            let err = self
                .socket
                .as_ref()
                .and_then(|s| s.take_error().ok().flatten())
                .map(Error::Io)
                .unwrap_or(Error::ConnectionReset);
            return Err(err);
        }
        if revents.intersects(Events::READ | Events::HANGUP) {
            let eof = self.read_available()?;
            self.process_input()?;
            if eof {
                debug!("peer closed the connection");
                return Err(Error::ConnectionReset);
            }
        }
        if self.socket.is_some() && (revents.contains(Events::WRITE) || self.head_sendable()) {
            self.flush_outqueue()?;
        }
        Ok(())
    }

    fn service_connecting(&mut self, fd: RawFd, revents: Events) {
        if fd == -1 {
            let due = self.connecting.as_ref().is_some_and(|he| {
                he.candidates.is_empty() || he.last_start.elapsed() >= HAPPY_EYEBALLS_DELAY
            });
            if due && !self.start_next_candidate() {
                self.fail_if_exhausted();
            }
            self.update_notifications();
            return;
        }

        let Some(he) = self.connecting.as_mut() else {
            return;
        };
        let Some(idx) = he.candidates.iter().position(|c| c.socket.as_raw_fd() == fd) else {
            warn!(fd, "event for unknown connect candidate");
            return;
        };
        let so_error = he.candidates[idx].socket.take_error();
        let failure = match so_error {
            Ok(Some(e)) => Some(e),
            Err(e) => Some(e),
            Ok(None) if revents.intersects(Events::ERROR | Events::HANGUP) => {
                Some(io::ErrorKind::ConnectionRefused.into())
            }
            Ok(None) => None,
        };

        if let Some(e) = failure {
            let cand = he.candidates.remove(idx);
            warn!(addr = %cand.addr, error = %e, "connect candidate failed");
            he.last_error = Some(e);
            if he.candidates.is_empty() && !self.start_next_candidate() {
                self.fail_if_exhausted();
            }
            self.update_notifications();
            return;
        }
        if !revents.contains(Events::WRITE) || he.candidates[idx].socket.peer_addr().is_err() {
            return;
        }

        let cand = he.candidates.swap_remove(idx);
        // losers are closed when the race state is dropped
        he.candidates.clear();
        info!(addr = %cand.addr, "connected");
        if let Err(e) = cand.socket.set_nodelay(true) {
            debug!(error = %e, "TCP_NODELAY not set");
        }
        self.socket = Some(cand.socket);
        self.finish_connect(Ok(()));
    }

    fn fail_if_exhausted(&mut self) {
        let exhausted = self
            .connecting
            .as_ref()
            .is_some_and(|he| he.candidates.is_empty() && he.waiting.is_empty());
        if exhausted {
            let err = self.take_connect_error();
            self.finish_connect(Err(err));
        }
    }

    /// One blocking iteration: poll every descriptor for at most
    /// `max_wait_ms` and service what fired, or tick on timeout.
    pub fn poll_once(&mut self, max_wait_ms: i32) -> Result<()> {
        let (fds, timeout) = self.get_fds();
        if fds.is_empty() {
            return Err(Error::NotConnected);
        }
        let timeout = if timeout < 0 {
            max_wait_ms
        } else {
            timeout.min(max_wait_ms)
        };
        let events = self.which_events();
        let wanted: Vec<(RawFd, Events)> = fds.iter().map(|&fd| (fd, events)).collect();
        let revents = poll::poll(&wanted, timeout)?;

        let was_connecting = self.connecting.is_some();
        let mut fired = false;
        for (&fd, rev) in fds.iter().zip(revents) {
            if rev.is_empty() {
                continue;
            }
            if was_connecting && self.connecting.is_none() {
                break;
            }
            fired = true;
            self.service_fd(fd, rev)?;
        }
        if !fired {
            self.service_fd(-1, Events::empty())?;
        }
        Ok(())
    }

    pub fn set_change_fd_cb(&mut self, cb: impl FnMut(RawFd, ChangeFd) + 'static) {
        self.notifier.change_fd = Some(Box::new(cb));
    }

    pub fn set_change_events_cb(&mut self, cb: impl FnMut(RawFd, Events) + 'static) {
        self.notifier.change_events = Some(Box::new(cb));
    }

    /// Tell the external reactor about descriptor and event mask changes.
    pub(crate) fn update_notifications(&mut self) {
        let (fds, _) = self.get_fds();
        let events = self.which_events();
        let primary = self.fd();
        let n = &mut self.notifier;

        if let Some(cb) = n.change_fd.as_mut() {
            for &fd in n.fds.iter().filter(|fd| !fds.contains(fd)) {
                cb(fd, ChangeFd::Del);
            }
            for &fd in fds.iter().filter(|fd| !n.fds.contains(fd)) {
                cb(fd, ChangeFd::Add);
            }
        }
        let fds_changed = n.fds != fds;
        n.fds = fds;

        if fds_changed || n.events != events {
            n.events = events;
            if let (Some(cb), Some(fd)) = (n.change_events.as_mut(), primary) {
                cb(fd, events);
            }
        }
    }
}
