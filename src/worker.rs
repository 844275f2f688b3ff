//! Per-worker event loop (§4.D, §4.F, §5): one `mio::Poll` driving a shared
//! listen descriptor and however many accepted connections are live, plus a
//! `signalfd` for `SIGHUP`/`SIGINT`/`SIGTERM` so signal delivery joins the
//! same reactor instead of racing it with a handler.
//!
//! Single-threaded, non-blocking, cooperative — matching `vintage`'s
//! `event_loop.rs` in spirit, but demultiplexing many request ids per
//! connection instead of handing each connection to a thread pool.

use crate::catalog::Catalog;
use crate::connection::Connection;
use crate::error::{Error, FatalError};
use mio::net::{UnixListener as MioUnixListener, UnixStream as MioUnixStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::SignalFd;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Descriptor headroom kept below `RLIMIT_NOFILE` before another connection
/// is accepted (§4.D, §5).
const FD_RESERVE: u64 = 5;

/// How long an accept-paused worker waits before trying again (§4.D).
const ACCEPT_RETRY: Duration = Duration::from_secs(1);

/// One accepted connection's socket plus the protocol state machine and
/// whatever `STDOUT`/`END_REQUEST` bytes `Connection` has produced but the
/// socket hasn't accepted yet.
///
/// `Connection` never touches a socket (see its doc comment), so the tail
/// left over from a partial, non-blocking `write` has to live here instead —
/// retained across `WRITABLE` events rather than discarded, per §5.
struct ConnEntry {
    stream: MioUnixStream,
    conn: Connection,
    pending_write: Vec<u8>,
}

pub struct Worker {
    poll: Poll,
    events: Events,
    listener: MioUnixListener,
    signals: SignalFd,
    connections: HashMap<Token, ConnEntry>,
    next_token: usize,
    in_flight: u64,
    accept_paused_until: Option<Instant>,
    catalog: Catalog,
    /// Path to the catalog database as seen from inside the chroot; used to
    /// reopen the store on `SIGHUP` (§4.A). The host-absolute path used for
    /// the very first open, resolved before `chroot`, is no longer valid
    /// once the worker is jailed.
    catalog_path: PathBuf,
    shutting_down: bool,
}

impl Worker {
    /// Builds the event loop around an already-listening descriptor
    /// (conventionally fd 3, handed down by the supervisor) and an already
    /// open catalog store. Blocks `SIGHUP`/`SIGINT`/`SIGTERM` for regular
    /// delivery and picks them up instead through a `signalfd` registered
    /// with the reactor; ignores `SIGPIPE` outright (§4.F, §6).
    pub fn new(listen_fd: RawFd, catalog: Catalog, catalog_path: PathBuf) -> Result<Self, FatalError> {
        let std_listener = unsafe { StdUnixListener::from_raw_fd(listen_fd) };
        std_listener.set_nonblocking(true)?;
        let mut listener = MioUnixListener::from_std(std_listener);

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGHUP);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        // Blocking these here, rather than relying on signal-safe async
        // handlers, is what lets the signalfd below observe them instead.
        unsafe { sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) }
            .map_err(|e| FatalError::Io(io::Error::from(e)))?;
        unsafe {
            nix::sys::signal::signal(Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)
                .map_err(|e| FatalError::Io(io::Error::from(e)))?;
        }
        let signals =
            SignalFd::with_flags(&mask, nix::sys::signalfd::SfdFlags::SFD_NONBLOCK)
                .map_err(|e| FatalError::Io(io::Error::from(e)))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let signal_fd = signals.as_raw_fd();
        poll.registry().register(
            &mut SourceFd(&signal_fd),
            SIGNALS,
            Interest::READABLE,
        )?;

        Ok(Worker {
            poll,
            events: Events::with_capacity(256),
            listener,
            signals,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            in_flight: 0,
            accept_paused_until: None,
            catalog,
            catalog_path,
            shutting_down: false,
        })
    }

    /// Runs until `SIGINT`/`SIGTERM` is observed. In-flight requests are not
    /// flushed on shutdown (§5).
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.shutting_down {
            let timeout = self
                .accept_paused_until
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            if let Some(deadline) = self.accept_paused_until {
                if Instant::now() >= deadline {
                    self.resume_accept()?;
                }
            }

            let events: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in events {
                match token {
                    LISTENER => self.accept_connections()?,
                    SIGNALS => self.handle_signals()?,
                    other => self.handle_connection_event(other, readable, writable),
                }
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<(), Error> {
        loop {
            if !self.accept_budget_remaining()? {
                self.pause_accept()?;
                return Ok(());
            }
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    self.connections.insert(
                        token,
                        ConnEntry {
                            stream,
                            conn: Connection::new(),
                            pending_write: Vec::new(),
                        },
                    );
                    self.in_flight += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(nix::libc::EMFILE) | Some(nix::libc::ENFILE)
                    ) =>
                {
                    self.pause_accept()?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accept_budget_remaining(&self) -> io::Result<bool> {
        let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(io::Error::from)?;
        Ok(self.in_flight + FD_RESERVE < soft)
    }

    fn pause_accept(&mut self) -> Result<(), Error> {
        if self.accept_paused_until.is_none() {
            log::warn!("descriptor reservation exhausted; pausing accept for 1s");
            self.poll.registry().deregister(&mut self.listener)?;
        }
        self.accept_paused_until = Some(Instant::now() + ACCEPT_RETRY);
        Ok(())
    }

    fn resume_accept(&mut self) -> Result<(), Error> {
        self.poll
            .registry()
            .register(&mut self.listener, LISTENER, Interest::READABLE)?;
        self.accept_paused_until = None;
        Ok(())
    }

    fn handle_connection_event(&mut self, token: Token, readable: bool, writable: bool) {
        let should_close = match self.connections.get_mut(&token) {
            Some(entry) => Self::service_connection(entry, &self.catalog, readable, writable),
            None => return,
        };
        if should_close {
            self.close_connection(token);
        }
    }

    /// On a `READABLE` event, reads whatever is available non-blockingly,
    /// feeds it through the connection's decoder, and queues anything the
    /// decoder produced onto `pending_write`. Either way, tries to drain
    /// `pending_write` to the socket. Returns whether the caller should tear
    /// the connection down — a real transport error or EOF, never
    /// `WouldBlock` on the write side, which just leaves bytes queued for
    /// the next `WRITABLE` event (§5).
    fn service_connection(entry: &mut ConnEntry, catalog: &Catalog, readable: bool, writable: bool) -> bool {
        if readable {
            let mut buf = [0u8; 4096];
            loop {
                match entry.stream.read(&mut buf) {
                    Ok(0) => return true,
                    Ok(n) => entry.conn.feed(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("connection read failed: {e}");
                        return true;
                    }
                }
            }

            if let Err(e) = entry.conn.process(catalog) {
                log::warn!("protocol violation; closing connection: {e}");
                return true;
            }

            entry.pending_write.extend_from_slice(&entry.conn.drain_output());
        }

        if (writable || !entry.pending_write.is_empty()) && Self::flush_pending(entry) {
            return true;
        }

        entry.conn.is_done() && entry.pending_write.is_empty()
    }

    /// Writes as much of `pending_write` as the socket currently accepts.
    /// `WouldBlock` stops without consuming the remainder — it is
    /// backpressure, not an error, and stays queued for the next
    /// `WRITABLE` event. Returns whether a genuine transport error occurred.
    fn flush_pending(entry: &mut ConnEntry) -> bool {
        while !entry.pending_write.is_empty() {
            match entry.stream.write(&entry.pending_write) {
                Ok(0) => return true,
                Ok(n) => {
                    entry.pending_write.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    log::warn!("connection write failed: {e}");
                    return true;
                }
            }
        }
        false
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut entry) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        if self.accept_paused_until.is_some() {
            let _ = self.resume_accept();
        }
    }

    fn handle_signals(&mut self) -> Result<(), Error> {
        while let Some(siginfo) = self.signals.read_signal().map_err(io::Error::from)? {
            match Signal::try_from(siginfo.ssi_signo as i32) {
                Ok(Signal::SIGHUP) => self.reopen_catalog(),
                Ok(Signal::SIGINT) | Ok(Signal::SIGTERM) => {
                    log::info!("received shutdown signal");
                    self.shutting_down = true;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn reopen_catalog(&mut self) {
        match Catalog::open(&self.catalog_path) {
            Ok(catalog) => {
                self.catalog = catalog;
                log::info!("catalog store reopened");
            }
            Err(e) => log::error!("failed to reopen catalog store, keeping old handle: {e}"),
        }
    }
}
