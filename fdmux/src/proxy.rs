//! The handle multiplexer: protocol state machine over one transport.
//!
//! A `Proxy` owns the framed transport stream, the fd↔handle tables, and
//! the pending-RPC bookkeeping. Everything it owns is touched by exactly
//! one thread, the thread that calls [`Proxy::run`], so there is no
//! locking anywhere in this module. Other threads interact only through
//! [`ProxyHandle`], which posts closures onto a task queue and kicks a
//! self-pipe so the poll loop wakes up to run them.
//!
//! The loop is readiness-driven: every registered pipe/socket descriptor
//! and the transport itself sit in one `poll(2)` set. Regular-file
//! entries carry no readability watcher (a regular file is always
//! "readable" to poll and would spin the loop); they exist solely to
//! answer pread/fstat requests from the peer.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use fdmux_proto::{FdDescriptor, FdKind, INVALID_HANDLE, Message};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::stream::{self, Stream, StreamKind, StreamRead};

/// Continuation for a Connect RPC: `(proxy, errno, handle)`.
pub type ConnectCallback = Box<dyn FnOnce(&mut Proxy, i32, u64) + Send>;

/// Continuation for a Pread RPC: `(proxy, errno, bytes)`.
pub type PreadCallback = Box<dyn FnOnce(&mut Proxy, i32, Vec<u8>) + Send>;

/// Continuation for an Fstat RPC: `(proxy, errno, size)`.
pub type FstatCallback = Box<dyn FnOnce(&mut Proxy, i32, u64) + Send>;

/// A closure posted from another thread, run on the proxy thread.
type Task = Box<dyn FnOnce(&mut Proxy) + Send>;

/// Which side of the link this proxy serves.
///
/// Each side allocates handles from its own half of the 63-bit space:
/// the host sets bit 62, the guest never does. Both sides run the same
/// allocator concurrently with requests in flight, so disjoint ranges
/// are the only way simultaneous allocations cannot mint the same
/// value. Explicitly supplied handles (bootstrap, transferred
/// descriptors) may fall in either half; the allocator steps past any
/// value that is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The vsock-listening side.
    Host,
    /// The vsock-dialing side.
    Guest,
}

impl Side {
    /// Base of this side's allocation range.
    const fn handle_base(self) -> u64 {
        match self {
            Self::Host => 1 << 62,
            Self::Guest => 0,
        }
    }
}

/// One registered local resource: its handle plus the owning adapter.
///
/// The readability watcher is implicit: membership in the fd table puts
/// pipe and socket entries into the poll set.
struct FdEntry {
    /// Handle the peer uses to address this resource.
    handle: u64,
    /// The adapter that owns the descriptor.
    stream: Stream,
}

/// Framed message stream over the transport descriptor.
struct Transport {
    /// The connected byte stream (vsock or, in tests, a socketpair end).
    file: std::fs::File,
}

impl Transport {
    /// Takes ownership of a connected transport descriptor.
    fn new(fd: OwnedFd) -> Self {
        Self {
            file: std::fs::File::from(fd),
        }
    }

    /// Raw descriptor for poll-set membership.
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Writes one framed message.
    fn send(&mut self, msg: &Message) -> io::Result<()> {
        fdmux_proto::encode(&mut self.file, msg)
    }

    /// Reads one framed message.
    fn recv(&mut self) -> io::Result<Message> {
        fdmux_proto::decode(&mut self.file)
    }
}

/// The multiplexer. One instance per side of the link, owned by the
/// thread that drives [`Proxy::run`].
pub struct Proxy {
    /// Framed transport to the peer.
    transport: Transport,
    /// fd → entry; lookups for local readability events.
    fd_table: HashMap<RawFd, FdEntry>,
    /// handle → fd; lookups for peer-addressed messages.
    handle_table: HashMap<u64, RawFd>,
    /// Which allocation range this proxy draws handles from.
    side: Side,
    /// Next allocator candidate within this side's range; never reused.
    next_handle: u64,
    /// Next RPC cookie. Independent of handles.
    next_cookie: u64,
    /// Connect RPCs in flight.
    pending_connect: HashMap<u64, ConnectCallback>,
    /// Pread RPCs in flight.
    pending_pread: HashMap<u64, PreadCallback>,
    /// Fstat RPCs in flight.
    pending_fstat: HashMap<u64, FstatCallback>,
    /// Cross-thread task queue.
    tasks: Receiver<Task>,
    /// Kept so [`Proxy::handle`] can mint more senders.
    task_tx: Sender<Task>,
    /// Read end of the wakeup self-pipe, in the poll set.
    wake_rx: OwnedFd,
    /// Write end of the wakeup self-pipe, shared with handles.
    wake_tx: Arc<OwnedFd>,
    /// Loop control; cleared by shutdown or link failure.
    running: bool,
    /// The transport error that ended the link, if any.
    link_error: Option<io::Error>,
}

impl Proxy {
    /// Constructs a multiplexer over a connected transport descriptor.
    ///
    /// `side` fixes this proxy's handle allocation range; the two ends
    /// of one link must pass opposite sides.
    pub fn new(transport: OwnedFd, side: Side) -> io::Result<Self> {
        let (wake_rx, wake_tx) = stream::pipe_pair()?;
        stream::set_nonblocking(wake_rx.as_raw_fd())?;
        stream::set_nonblocking(wake_tx.as_raw_fd())?;
        let (task_tx, tasks) = mpsc::channel();
        Ok(Self {
            transport: Transport::new(transport),
            fd_table: HashMap::new(),
            handle_table: HashMap::new(),
            side,
            next_handle: side.handle_base() + 1,
            next_cookie: 1,
            pending_connect: HashMap::new(),
            pending_pread: HashMap::new(),
            pending_fstat: HashMap::new(),
            tasks,
            task_tx,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            running: false,
            link_error: None,
        })
    }

    /// A clonable, `Send` handle for posting work onto this proxy's
    /// thread. Valid for the lifetime of the proxy; posts after teardown
    /// are reported as failures by the blocking helpers.
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            tasks: self.task_tx.clone(),
            wake: Arc::clone(&self.wake_tx),
        }
    }

    /// Registers a local descriptor and starts forwarding for it.
    ///
    /// Pass [`INVALID_HANDLE`] to allocate a fresh handle. Returns
    /// [`INVALID_HANDLE`], without mutating any state, if the requested
    /// handle or the descriptor is already registered, or if the adapter
    /// cannot be set up. This is the only way a local fd becomes visible
    /// to the peer.
    pub fn register_fd(&mut self, fd: OwnedFd, kind: StreamKind, handle: u64) -> u64 {
        let raw = fd.as_raw_fd();
        if self.fd_table.contains_key(&raw) {
            warn!(fd = raw, "descriptor already registered");
            return INVALID_HANDLE;
        }
        if handle != INVALID_HANDLE && self.handle_table.contains_key(&handle) {
            warn!(handle, "handle already registered");
            return INVALID_HANDLE;
        }
        let stream = match Stream::new(fd, kind) {
            Ok(s) => s,
            Err(e) => {
                warn!(fd = raw, error = %e, "failed to wrap descriptor");
                return INVALID_HANDLE;
            }
        };
        let handle = if handle == INVALID_HANDLE {
            self.alloc_handle()
        } else {
            handle
        };
        self.fd_table.insert(raw, FdEntry { handle, stream });
        self.handle_table.insert(handle, raw);
        debug!(fd = raw, handle, ?kind, "registered descriptor");
        handle
    }

    /// Removes a registered descriptor; dropping the entry closes it.
    ///
    /// Unknown descriptors are logged and ignored.
    pub fn unregister_fd(&mut self, fd: RawFd) {
        if self.fd_table.contains_key(&fd) {
            self.destroy_entry(fd);
        } else {
            warn!(fd, "unregister of unknown descriptor ignored");
        }
    }

    /// Asks the peer to connect to a Unix socket on *its* side.
    ///
    /// The callback runs on the proxy thread with the peer's errno and
    /// the handle the peer registered the new socket under.
    pub fn connect(&mut self, path: &str, cb: ConnectCallback) {
        if self.link_error.is_some() {
            cb(self, libc::ECONNRESET, INVALID_HANDLE);
            return;
        }
        let cookie = self.alloc_cookie();
        self.pending_connect.insert(cookie, cb);
        self.send_or_fail(&Message::ConnectRequest {
            cookie,
            path: path.to_owned(),
        });
    }

    /// Positional read against a regular file registered on the peer.
    pub fn pread(&mut self, handle: u64, count: u64, offset: u64, cb: PreadCallback) {
        if self.link_error.is_some() {
            cb(self, libc::ECONNRESET, Vec::new());
            return;
        }
        let cookie = self.alloc_cookie();
        self.pending_pread.insert(cookie, cb);
        self.send_or_fail(&Message::PreadRequest {
            cookie,
            handle,
            count,
            offset,
        });
    }

    /// Size query against a regular file registered on the peer.
    pub fn fstat(&mut self, handle: u64, cb: FstatCallback) {
        if self.link_error.is_some() {
            cb(self, libc::ECONNRESET, 0);
            return;
        }
        let cookie = self.alloc_cookie();
        self.pending_fstat.insert(cookie, cb);
        self.send_or_fail(&Message::FstatRequest { cookie, handle });
    }

    /// Tells the peer to tear down its end of `handle`. Fire-and-forget.
    pub fn close(&mut self, handle: u64) {
        if self.link_error.is_some() {
            return;
        }
        self.send_or_fail(&Message::Close { handle });
    }

    /// Stops the event loop after the current dispatch completes.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Drives the multiplexer until shutdown or link failure.
    ///
    /// Returns [`Error::LinkDown`] when the transport failed; by then
    /// every pending callback has been failed and every entry destroyed.
    pub fn run(&mut self) -> Result<()> {
        self.running = self.link_error.is_none();
        while self.running {
            self.drain_tasks();
            if !self.running {
                break;
            }
            let mut pfds = self.build_poll_set();
            // SAFETY: pfds is a live, correctly sized pollfd array.
            let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            let transport_fd = self.transport.raw_fd();
            let wake_fd = self.wake_rx.as_raw_fd();
            for pfd in &pfds {
                if pfd.revents == 0 {
                    continue;
                }
                if !self.running {
                    break;
                }
                if pfd.fd == wake_fd {
                    self.drain_wake();
                    self.drain_tasks();
                } else if pfd.fd == transport_fd {
                    self.on_transport_readable();
                } else {
                    if pfd.revents & libc::POLLOUT != 0 {
                        self.on_local_writable(pfd.fd);
                    }
                    if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                        self.on_local_readable(pfd.fd);
                    }
                }
            }
        }
        match self.link_error.take() {
            Some(err) => Err(Error::LinkDown(err)),
            None => Ok(()),
        }
    }

    /// Next generated handle, from this side's half of the space.
    ///
    /// Values already bound (explicit registrations landing in our
    /// range) are stepped past, never rebound. Handles stay below 2^63
    /// and are never reused within a proxy lifetime.
    fn alloc_handle(&mut self) -> u64 {
        loop {
            let handle = self.next_handle;
            debug_assert!(handle - self.side.handle_base() < 1 << 62);
            self.next_handle += 1;
            if !self.handle_table.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Next RPC cookie.
    fn alloc_cookie(&mut self) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        cookie
    }

    /// Poll set: wake pipe, transport, and every watched local entry.
    fn build_poll_set(&self) -> Vec<libc::pollfd> {
        let mut pfds = Vec::with_capacity(2 + self.fd_table.len());
        pfds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pfds.push(libc::pollfd {
            fd: self.transport.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for (&fd, entry) in &self.fd_table {
            let Some(mut events) = entry.stream.poll_events() else {
                continue;
            };
            if entry.stream.has_pending_writes() {
                events |= libc::POLLOUT;
            }
            pfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
        pfds
    }

    /// Runs queued cross-thread tasks.
    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            task(self);
            if !self.running && self.link_error.is_none() {
                break;
            }
        }
    }

    /// Empties the wakeup self-pipe.
    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: nonblocking read of the owned wake pipe.
            let n = unsafe {
                libc::read(self.wake_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                return;
            }
        }
    }

    /// Reads and dispatches one message; any transport error is total
    /// link loss.
    fn on_transport_readable(&mut self) {
        let msg = match self.transport.recv() {
            Ok(msg) => msg,
            Err(err) => {
                self.on_link_down(err);
                return;
            }
        };
        self.dispatch(msg);
    }

    /// Protocol dispatch for one peer message.
    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::Data { handle, blob, fds } => self.on_data(handle, blob, fds),
            Message::Close { handle } => match self.handle_table.get(&handle).copied() {
                Some(fd) => {
                    debug!(handle, "peer closed handle");
                    self.destroy_entry(fd);
                }
                None => warn!(handle, "close for unknown handle dropped"),
            },
            Message::ConnectRequest { cookie, path } => self.on_connect_request(cookie, &path),
            Message::ConnectResponse {
                cookie,
                error,
                handle,
            } => match self.pending_connect.remove(&cookie) {
                Some(cb) => cb(self, error, handle),
                None => warn!(cookie, "connect response with unknown cookie dropped"),
            },
            Message::PreadRequest {
                cookie,
                handle,
                count,
                offset,
            } => self.on_pread_request(cookie, handle, count, offset),
            Message::PreadResponse { cookie, error, blob } => {
                match self.pending_pread.remove(&cookie) {
                    Some(cb) => cb(self, error, blob),
                    None => warn!(cookie, "pread response with unknown cookie dropped"),
                }
            }
            Message::FstatRequest { cookie, handle } => self.on_fstat_request(cookie, handle),
            Message::FstatResponse { cookie, error, size } => {
                match self.pending_fstat.remove(&cookie) {
                    Some(cb) => cb(self, error, size),
                    None => warn!(cookie, "fstat response with unknown cookie dropped"),
                }
            }
            other => warn!(?other, "unhandled message dropped"),
        }
    }

    /// Peer payload for a registered local resource.
    fn on_data(&mut self, handle: u64, blob: Vec<u8>, fds: Vec<FdDescriptor>) {
        let Some(&fd) = self.handle_table.get(&handle) else {
            warn!(handle, "data for unknown handle dropped");
            return;
        };
        let mut local_fds = Vec::with_capacity(fds.len());
        for desc in &fds {
            match self.materialize_fd(desc) {
                Ok(local) => local_fds.push(local),
                Err(e) => {
                    warn!(handle = desc.handle, error = %e, "failed to materialize transferred descriptor");
                }
            }
        }
        let Some(entry) = self.fd_table.get_mut(&fd) else {
            return;
        };
        if let Err(e) = entry.stream.write(&blob, local_fds) {
            debug!(handle, error = %e, "local write failed; closing handle");
            self.destroy_entry(fd);
            self.send_or_fail(&Message::Close { handle });
        }
    }

    /// Synthesizes the local end of a transferred descriptor.
    ///
    /// One end of a fresh pair is registered under the *sender-chosen*
    /// handle so both sides address the same logical channel; the other
    /// end is handed to the local consumer.
    fn materialize_fd(&mut self, desc: &FdDescriptor) -> io::Result<OwnedFd> {
        let (keep, give, kind) = match desc.kind {
            FdKind::Socket => {
                let (keep, give) = stream::socket_pair()?;
                (keep, give, StreamKind::Socket)
            }
            // The consumer gets the end matching the original direction;
            // the proxy keeps the opposite end of the fresh pipe.
            FdKind::PipeRead => {
                let (give, keep) = stream::pipe_pair()?;
                (keep, give, StreamKind::Pipe)
            }
            FdKind::PipeWrite => {
                let (keep, give) = stream::pipe_pair()?;
                (keep, give, StreamKind::Pipe)
            }
        };
        if self.register_fd(keep, kind, desc.handle) == INVALID_HANDLE {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transferred handle already registered",
            ));
        }
        Ok(give)
    }

    /// Peer asked us to connect to a local Unix socket.
    fn on_connect_request(&mut self, cookie: u64, path: &str) {
        let resp = match stream::unix_connect(std::path::Path::new(path)) {
            Ok(fd) => {
                let handle = self.register_fd(fd, StreamKind::Socket, INVALID_HANDLE);
                if handle == INVALID_HANDLE {
                    Message::ConnectResponse {
                        cookie,
                        error: libc::EIO,
                        handle: INVALID_HANDLE,
                    }
                } else {
                    Message::ConnectResponse {
                        cookie,
                        error: 0,
                        handle,
                    }
                }
            }
            Err(e) => {
                debug!(path, error = %e, "connect request failed");
                Message::ConnectResponse {
                    cookie,
                    error: e.raw_os_error().unwrap_or(libc::EIO),
                    handle: INVALID_HANDLE,
                }
            }
        };
        self.send_or_fail(&resp);
    }

    /// Peer asked for a positional read against a local file handle.
    fn on_pread_request(&mut self, cookie: u64, handle: u64, count: u64, offset: u64) {
        let resp = match self.entry_for_handle(handle) {
            Some(entry) => match entry.stream.pread(count, offset) {
                Some((error, blob)) => Message::PreadResponse { cookie, error, blob },
                None => Message::PreadResponse {
                    cookie,
                    error: libc::EOPNOTSUPP,
                    blob: Vec::new(),
                },
            },
            None => Message::PreadResponse {
                cookie,
                error: libc::EBADF,
                blob: Vec::new(),
            },
        };
        self.send_or_fail(&resp);
    }

    /// Peer asked for the size of a local file handle.
    fn on_fstat_request(&mut self, cookie: u64, handle: u64) {
        let resp = match self.entry_for_handle(handle) {
            Some(entry) => match entry.stream.fstat() {
                Some((error, size)) => Message::FstatResponse { cookie, error, size },
                None => Message::FstatResponse {
                    cookie,
                    error: libc::EOPNOTSUPP,
                    size: 0,
                },
            },
            None => Message::FstatResponse {
                cookie,
                error: libc::EBADF,
                size: 0,
            },
        };
        self.send_or_fail(&resp);
    }

    /// Entry lookup by peer-addressed handle.
    fn entry_for_handle(&mut self, handle: u64) -> Option<&mut FdEntry> {
        let fd = self.handle_table.get(&handle).copied()?;
        self.fd_table.get_mut(&fd)
    }

    /// A watched local descriptor became readable (or hung up).
    fn on_local_readable(&mut self, fd: RawFd) {
        let Some(entry) = self.fd_table.get_mut(&fd) else {
            // Destroyed earlier in this poll batch.
            return;
        };
        let handle = entry.handle;
        match entry.stream.read() {
            Ok(StreamRead::Data { blob, fds }) => {
                let descriptors = self.register_incoming_fds(fds);
                self.send_or_fail(&Message::Data {
                    handle,
                    blob,
                    fds: descriptors,
                });
            }
            Ok(StreamRead::WouldBlock) => {}
            Ok(StreamRead::Closed) => {
                debug!(handle, "local descriptor closed; notifying peer");
                self.destroy_entry(fd);
                self.send_or_fail(&Message::Close { handle });
            }
            Err(e) => {
                debug!(handle, error = %e, "local read failed; notifying peer");
                self.destroy_entry(fd);
                self.send_or_fail(&Message::Close { handle });
            }
        }
    }

    /// A socket with queued sends became writable.
    fn on_local_writable(&mut self, fd: RawFd) {
        let Some(entry) = self.fd_table.get_mut(&fd) else {
            return;
        };
        let handle = entry.handle;
        if let Err(e) = entry.stream.flush() {
            debug!(handle, error = %e, "flush failed; closing handle");
            self.destroy_entry(fd);
            self.send_or_fail(&Message::Close { handle });
        }
    }

    /// Classifies and registers descriptors pulled off a local socket,
    /// producing the wire descriptors that ride with the payload.
    ///
    /// Unforwardable descriptors (regular files, read-write FIFOs) are
    /// dropped with a warning; regular files cross the link via the
    /// pread/fstat path instead of fd passing.
    fn register_incoming_fds(&mut self, fds: Vec<OwnedFd>) -> Vec<FdDescriptor> {
        let mut out = Vec::with_capacity(fds.len());
        for fd in fds {
            let kind = match stream::classify_fd(fd.as_raw_fd()) {
                Ok(Some(kind)) => kind,
                Ok(None) => {
                    warn!(fd = fd.as_raw_fd(), "unforwardable descriptor dropped");
                    continue;
                }
                Err(e) => {
                    warn!(fd = fd.as_raw_fd(), error = %e, "failed to classify descriptor");
                    continue;
                }
            };
            let handle = self.register_fd(fd, kind.into(), INVALID_HANDLE);
            if handle == INVALID_HANDLE {
                continue;
            }
            out.push(FdDescriptor { handle, kind });
        }
        out
    }

    /// Removes both table entries for `fd`; dropping the entry closes it.
    fn destroy_entry(&mut self, fd: RawFd) {
        if let Some(entry) = self.fd_table.remove(&fd) {
            self.handle_table.remove(&entry.handle);
            debug!(fd, handle = entry.handle, "destroyed entry");
        }
    }

    /// Sends a message, treating any failure as total link loss.
    fn send_or_fail(&mut self, msg: &Message) {
        if let Err(err) = self.transport.send(msg) {
            self.on_link_down(err);
        }
    }

    /// Total link loss: fail every pending RPC exactly once, destroy
    /// every entry, and leave the loop in its terminal state.
    fn on_link_down(&mut self, err: io::Error) {
        if self.link_error.is_some() {
            return;
        }
        warn!(error = %err, "transport failed; tearing down link");
        self.fd_table.clear();
        self.handle_table.clear();
        self.running = false;
        self.link_error = Some(err);
        let connects = std::mem::take(&mut self.pending_connect);
        let preads = std::mem::take(&mut self.pending_pread);
        let fstats = std::mem::take(&mut self.pending_fstat);
        for (_, cb) in connects {
            cb(self, libc::ECONNRESET, INVALID_HANDLE);
        }
        for (_, cb) in preads {
            cb(self, libc::ECONNRESET, Vec::new());
        }
        for (_, cb) in fstats {
            cb(self, libc::ECONNRESET, 0);
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("side", &self.side)
            .field("entries", &self.fd_table.len())
            .field("next_handle", &self.next_handle)
            .field("next_cookie", &self.next_cookie)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

/// Clonable cross-thread handle to a [`Proxy`].
///
/// The blocking helpers implement the filesystem-thread contract: post a
/// task, then block on a one-shot channel that the RPC continuation
/// signals from the proxy thread. Link failure releases every blocked
/// caller with `ECONNRESET`.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    /// Task queue into the proxy thread.
    tasks: Sender<Task>,
    /// Write end of the proxy's wakeup self-pipe.
    wake: Arc<OwnedFd>,
}

impl ProxyHandle {
    /// Posts a closure onto the proxy thread. Returns `false` if the
    /// proxy is gone.
    pub fn post(&self, task: impl FnOnce(&mut Proxy) + Send + 'static) -> bool {
        if self.tasks.send(Box::new(task)).is_err() {
            return false;
        }
        // SAFETY: one-byte write to the nonblocking wake pipe; a full
        // pipe already guarantees a pending wakeup.
        let _ = unsafe { libc::write(self.wake.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        true
    }

    /// Issues a Pread RPC and blocks until its response (or link death).
    pub fn pread_blocking(&self, handle: u64, count: u64, offset: u64) -> (i32, Vec<u8>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let posted = self.post(move |proxy| {
            proxy.pread(
                handle,
                count,
                offset,
                Box::new(move |_proxy, error, blob| {
                    let _ = tx.send((error, blob));
                }),
            );
        });
        if !posted {
            return (libc::ECONNRESET, Vec::new());
        }
        rx.recv()
            .unwrap_or_else(|_| (libc::ECONNRESET, Vec::new()))
    }

    /// Issues an Fstat RPC and blocks until its response (or link death).
    pub fn fstat_blocking(&self, handle: u64) -> (i32, u64) {
        let (tx, rx) = mpsc::sync_channel(1);
        let posted = self.post(move |proxy| {
            proxy.fstat(
                handle,
                Box::new(move |_proxy, error, size| {
                    let _ = tx.send((error, size));
                }),
            );
        });
        if !posted {
            return (libc::ECONNRESET, 0);
        }
        rx.recv().unwrap_or((libc::ECONNRESET, 0))
    }

    /// Fire-and-forget Close for a remote handle.
    pub fn close(&self, handle: u64) {
        let _ = self.post(move |proxy| proxy.close(handle));
    }

    /// Asks the proxy loop to exit cleanly.
    pub fn shutdown(&self) {
        let _ = self.post(Proxy::stop);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Spawns a proxy loop on its own thread.
    fn spawn_proxy(
        transport: OwnedFd,
        side: Side,
    ) -> (ProxyHandle, thread::JoinHandle<Result<()>>) {
        let mut proxy = Proxy::new(transport, side).unwrap();
        let handle = proxy.handle();
        let join = thread::spawn(move || proxy.run());
        (handle, join)
    }

    /// Registers a descriptor on the proxy thread and returns the handle.
    fn register(h: &ProxyHandle, fd: OwnedFd, kind: StreamKind, handle: u64) -> u64 {
        let (tx, rx) = mpsc::sync_channel(1);
        assert!(h.post(move |p| {
            let _ = tx.send(p.register_fd(fd, kind, handle));
        }));
        rx.recv_timeout(TIMEOUT).unwrap()
    }

    /// Reads from a nonblocking socket adapter until data arrives.
    fn read_until_data(stream: &mut Stream) -> (Vec<u8>, Vec<OwnedFd>) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match stream.read().unwrap() {
                StreamRead::Data { blob, fds } => return (blob, fds),
                StreamRead::WouldBlock => {
                    assert!(Instant::now() < deadline, "timed out waiting for data");
                    thread::sleep(Duration::from_millis(5));
                }
                StreamRead::Closed => panic!("unexpected close"),
            }
        }
    }

    /// Reads from a nonblocking socket adapter until the peer closes.
    fn read_until_closed(stream: &mut Stream) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match stream.read().unwrap() {
                StreamRead::Closed => return,
                StreamRead::Data { .. } | StreamRead::WouldBlock => {
                    assert!(Instant::now() < deadline, "timed out waiting for close");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    /// Blocking read from a raw descriptor.
    fn raw_read(fd: RawFd, buf: &mut [u8]) -> usize {
        // SAFETY: test-owned descriptor and live buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        assert!(n >= 0);
        n as usize
    }

    #[test]
    fn data_and_descriptor_round_trip_with_explicit_handles() {
        let (ta, tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        let (hb, jb) = spawn_proxy(tb, Side::Guest);

        // Bootstrap-style: both sides register one socketpair end under
        // the same explicit handle 7.
        let (sa_proxy, sa_local) = stream::socket_pair().unwrap();
        let (sb_proxy, sb_local) = stream::socket_pair().unwrap();
        assert_eq!(register(&ha, sa_proxy, StreamKind::Socket, 7), 7);
        assert_eq!(register(&hb, sb_proxy, StreamKind::Socket, 7), 7);

        // Side A's consumer sends "hello" plus a pipe write end.
        let (pipe_r, pipe_w) = stream::pipe_pair().unwrap();
        let mut local_a = Stream::new(sa_local, StreamKind::Socket).unwrap();
        local_a.write(b"hello", vec![pipe_w]).unwrap();

        // Side B's consumer sees "hello" plus a freshly minted fd of the
        // same kind (not the same value).
        let mut local_b = Stream::new(sb_local, StreamKind::Socket).unwrap();
        let (blob, fds) = read_until_data(&mut local_b);
        assert_eq!(blob, b"hello");
        assert_eq!(fds.len(), 1);

        // Writing into the minted fd surfaces at the original pipe.
        // SAFETY: test-owned descriptor and live buffer.
        let n = unsafe { libc::write(fds[0].as_raw_fd(), b"ping".as_ptr().cast(), 4) };
        assert_eq!(n, 4);
        let mut buf = [0u8; 16];
        let got = raw_read(pipe_r.as_raw_fd(), &mut buf);
        assert_eq!(&buf[..got], b"ping");

        // Close propagation: dropping A's consumer end must EOF B's.
        drop(local_a);
        read_until_closed(&mut local_b);

        ha.shutdown();
        hb.shutdown();
        let _ = ja.join().unwrap();
        let _ = jb.join().unwrap();
    }

    #[test]
    fn register_with_existing_handle_fails_without_mutation() {
        let (ta, _tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);

        let (pipe_r, _keep_w) = stream::pipe_pair().unwrap();
        let first_fd = pipe_r.as_raw_fd();
        assert_eq!(register(&ha, pipe_r, StreamKind::Pipe, 5), 5);

        let (other_r, _other_w) = stream::pipe_pair().unwrap();
        let (tx, rx) = mpsc::sync_channel(1);
        assert!(ha.post(move |p| {
            let dup = p.register_fd(other_r, StreamKind::Pipe, 5);
            let still_first = p.handle_table.get(&5).copied();
            let _ = tx.send((dup, still_first));
        }));
        let (dup, still_first) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(dup, INVALID_HANDLE);
        assert_eq!(still_first, Some(first_fd));

        ha.shutdown();
        let _ = ja.join().unwrap();
    }

    #[test]
    fn allocator_never_rebinds_a_live_handle() {
        let (ta, _tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Guest);

        // Bootstrap-style: an explicit registration claims handle 1,
        // the first value the guest-side allocator would mint.
        let (first_r, _first_w) = stream::pipe_pair().unwrap();
        let first_fd = first_r.as_raw_fd();
        assert_eq!(register(&ha, first_r, StreamKind::Pipe, 1), 1);

        let (second_r, _second_w) = stream::pipe_pair().unwrap();
        let (tx, rx) = mpsc::sync_channel(1);
        assert!(ha.post(move |p| {
            let allocated = p.register_fd(second_r, StreamKind::Pipe, INVALID_HANDLE);
            let first_binding = p.handle_table.get(&1).copied();
            let _ = tx.send((allocated, first_binding));
        }));
        let (allocated, first_binding) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_ne!(allocated, INVALID_HANDLE);
        assert_ne!(allocated, 1, "allocator handed out an in-use handle");
        assert_eq!(first_binding, Some(first_fd));

        ha.shutdown();
        let _ = ja.join().unwrap();
    }

    #[test]
    fn sides_allocate_from_disjoint_ranges() {
        let (ta, _tb) = stream::socket_pair().unwrap();
        let (tc, _td) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        let (hb, jb) = spawn_proxy(tc, Side::Guest);

        let (host_r, _host_w) = stream::pipe_pair().unwrap();
        let host_handle = register(&ha, host_r, StreamKind::Pipe, 0);
        let (guest_r, _guest_w) = stream::pipe_pair().unwrap();
        let guest_handle = register(&hb, guest_r, StreamKind::Pipe, 0);

        assert_ne!(host_handle & (1 << 62), 0);
        assert_eq!(guest_handle & (1 << 62), 0);
        assert_ne!(host_handle, guest_handle);

        ha.shutdown();
        hb.shutdown();
        let _ = ja.join().unwrap();
        let _ = jb.join().unwrap();
    }

    #[test]
    fn pread_and_fstat_over_the_link() {
        let (ta, tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        let (hb, jb) = spawn_proxy(tb, Side::Guest);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(register(&ha, OwnedFd::from(file), StreamKind::File, 9), 9);

        // Exact bytes for offset < size.
        let (err, blob) = hb.pread_blocking(9, 4, 2);
        assert_eq!(err, 0);
        assert_eq!(blob, b"2345");

        // Clamped at end-of-file.
        let (err, blob) = hb.pread_blocking(9, 100, 7);
        assert_eq!(err, 0);
        assert_eq!(blob, b"789");

        // At or past end-of-file: success, zero bytes.
        let (err, blob) = hb.pread_blocking(9, 10, 10);
        assert_eq!(err, 0);
        assert!(blob.is_empty());

        let (err, size) = hb.fstat_blocking(9);
        assert_eq!(err, 0);
        assert_eq!(size, 10);

        // A handle nobody registered: errno reply, not silence.
        let (err, blob) = hb.pread_blocking(99, 10, 0);
        assert_eq!(err, libc::EBADF);
        assert!(blob.is_empty());

        ha.shutdown();
        hb.shutdown();
        let _ = ja.join().unwrap();
        let _ = jb.join().unwrap();
    }

    #[test]
    fn link_failure_fails_all_pending_and_destroys_entries() {
        let (ta, tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        // The test plays the silent peer on tb.
        let mut peer = std::fs::File::from(tb);

        // One registered entry whose closure the test can observe.
        let (pipe_r, pipe_w) = stream::pipe_pair().unwrap();
        let handle = register(&ha, pipe_w, StreamKind::Pipe, 0);
        assert_ne!(handle, INVALID_HANDLE);

        // Two Pread RPCs that will never be answered.
        let h1 = ha.clone();
        let t1 = thread::spawn(move || h1.pread_blocking(42, 8, 0));
        let h2 = ha.clone();
        let t2 = thread::spawn(move || h2.pread_blocking(43, 8, 0));

        // Both requests on the wire means both are pending.
        let _req1: Message = fdmux_proto::decode(&mut peer).unwrap();
        let _req2: Message = fdmux_proto::decode(&mut peer).unwrap();

        // Kill the transport.
        drop(peer);

        let (err, blob) = t1.join().unwrap();
        assert_eq!(err, libc::ECONNRESET);
        assert!(blob.is_empty());
        let (err, _) = t2.join().unwrap();
        assert_eq!(err, libc::ECONNRESET);

        // Entry destroyed: our read end of the registered pipe sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(raw_read(pipe_r.as_raw_fd(), &mut buf), 0);

        // Terminal state is reported as link-down.
        assert!(matches!(ja.join().unwrap(), Err(Error::LinkDown(_))));
    }

    #[test]
    fn empty_data_and_unknown_cookie_are_not_fatal() {
        let (ta, tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        let mut peer = std::fs::File::from(tb);

        let (sp_proxy, sp_local) = stream::socket_pair().unwrap();
        assert_eq!(register(&ha, sp_proxy, StreamKind::Socket, 7), 7);

        // Zero-length Data is a valid payload, not a close signal.
        fdmux_proto::encode(
            &mut peer,
            &Message::Data {
                handle: 7,
                blob: Vec::new(),
                fds: Vec::new(),
            },
        )
        .unwrap();

        // A response cookie nobody is waiting for is dropped.
        fdmux_proto::encode(
            &mut peer,
            &Message::PreadResponse {
                cookie: 999,
                error: 0,
                blob: vec![1, 2, 3],
            },
        )
        .unwrap();

        // The entry must still be alive and forwarding.
        fdmux_proto::encode(
            &mut peer,
            &Message::Data {
                handle: 7,
                blob: b"hi".to_vec(),
                fds: Vec::new(),
            },
        )
        .unwrap();

        let mut local = Stream::new(sp_local, StreamKind::Socket).unwrap();
        let (blob, fds) = read_until_data(&mut local);
        assert_eq!(blob, b"hi");
        assert!(fds.is_empty());

        ha.shutdown();
        let _ = ja.join().unwrap();
    }

    #[test]
    fn connect_request_registers_and_replies() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("svc.sock");
        let listener = stream::unix_listen(&sock_path).unwrap();

        let (ta, tb) = stream::socket_pair().unwrap();
        let (ha, ja) = spawn_proxy(ta, Side::Host);
        let mut peer = std::fs::File::from(tb);

        fdmux_proto::encode(
            &mut peer,
            &Message::ConnectRequest {
                cookie: 11,
                path: sock_path.to_string_lossy().into_owned(),
            },
        )
        .unwrap();

        let accepted = stream::accept_one(&listener).unwrap();
        let resp: Message = fdmux_proto::decode(&mut peer).unwrap();
        let handle = match resp {
            Message::ConnectResponse {
                cookie: 11,
                error: 0,
                handle,
            } => handle,
            other => panic!("unexpected response {other:?}"),
        };
        assert_ne!(handle, INVALID_HANDLE);
        // Host-side allocations come from the upper half of the space.
        assert_ne!(handle & (1 << 62), 0);

        // Data addressed at the new handle lands on the accepted socket.
        fdmux_proto::encode(
            &mut peer,
            &Message::Data {
                handle,
                blob: b"via-connect".to_vec(),
                fds: Vec::new(),
            },
        )
        .unwrap();
        let mut buf = [0u8; 32];
        let n = raw_read(accepted.as_raw_fd(), &mut buf);
        assert_eq!(&buf[..n], b"via-connect");

        // Connecting to a path nobody listens on reports the OS error.
        fdmux_proto::encode(
            &mut peer,
            &Message::ConnectRequest {
                cookie: 12,
                path: dir.path().join("missing.sock").to_string_lossy().into_owned(),
            },
        )
        .unwrap();
        let second: Message = fdmux_proto::decode(&mut peer).unwrap();
        match second {
            Message::ConnectResponse {
                cookie: 12,
                error,
                handle,
            } => {
                assert_ne!(error, 0);
                assert_eq!(handle, INVALID_HANDLE);
            }
            other => panic!("unexpected response {other:?}"),
        }

        ha.shutdown();
        let _ = ja.join().unwrap();
    }
}
