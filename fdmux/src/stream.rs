//! Local resource adapters: one uniform contract over pipes, sockets,
//! and read-only regular files.
//!
//! The multiplexer treats "this descriptor became readable" identically
//! for every resource kind; everything kind-specific (chunking, ancillary
//! descriptor extraction, positional reads) lives here. The kind is fixed
//! at registration time and the set of kinds is closed, so dispatch is a
//! plain enum rather than a trait object.
//!
//! All descriptor plumbing is raw `libc`, in the same style as the vsock
//! and watchdog-pipe code this crate grew out of.

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use fdmux_proto::FdKind;
use tracing::warn;

/// Bytes read from a pipe or socket per readability event.
const CHUNK_SIZE: usize = 4096;

/// Upper bound on descriptors accepted in one ancillary message.
const MAX_TRANSFER_FDS: usize = 32;

/// Control-message buffer: `CMSG_SPACE` for [`MAX_TRANSFER_FDS`] RawFds,
/// rounded up generously.
const CMSG_BUF_LEN: usize = 256;

/// Cap on a single positional read, keeping the response comfortably
/// under the codec's 16 MiB frame limit.
const MAX_PREAD: u64 = 8 * 1024 * 1024;

/// Resource kind selected when a descriptor is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// One end of a pipe (either direction).
    Pipe,
    /// A connected stream socket that may carry ancillary descriptors.
    Socket,
    /// A read-only regular file, answering `pread`/`fstat` only.
    File,
}

impl From<FdKind> for StreamKind {
    fn from(kind: FdKind) -> Self {
        match kind {
            FdKind::Socket => Self::Socket,
            FdKind::PipeRead | FdKind::PipeWrite => Self::Pipe,
        }
    }
}

/// Outcome of one adapter read.
#[derive(Debug)]
pub enum StreamRead {
    /// A chunk of payload, plus any descriptors that rode along.
    Data {
        /// Raw bytes, at most one chunk.
        blob: Vec<u8>,
        /// Ancillary descriptors received on a socket (empty for pipes).
        fds: Vec<OwnedFd>,
    },
    /// The peer closed its end.
    Closed,
    /// Spurious wakeup on a nonblocking descriptor; nothing to do.
    WouldBlock,
}

/// A registered local resource, owning its descriptor.
///
/// Dropping the stream closes the descriptor; ownership transfers in at
/// registration and never leaves.
#[derive(Debug)]
pub struct Stream {
    /// Kind-specific state.
    inner: Inner,
}

/// Closed set of adapter variants.
#[derive(Debug)]
enum Inner {
    /// Pipe end adapter.
    Pipe(PipeStream),
    /// Socket adapter with its pending-send queue.
    Socket(SocketStream),
    /// Regular-file adapter.
    File(FileStream),
}

impl Stream {
    /// Wraps `fd` in the adapter for `kind`.
    ///
    /// Sockets are switched to nonblocking so a slow local consumer
    /// queues sends instead of stalling the event loop.
    pub fn new(fd: OwnedFd, kind: StreamKind) -> io::Result<Self> {
        let inner = match kind {
            StreamKind::Pipe => Inner::Pipe(PipeStream { fd }),
            StreamKind::Socket => {
                set_nonblocking(fd.as_raw_fd())?;
                Inner::Socket(SocketStream {
                    fd,
                    queue: VecDeque::new(),
                })
            }
            StreamKind::File => Inner::File(FileStream { fd }),
        };
        Ok(Self { inner })
    }

    /// The wrapped raw descriptor (for poll-set membership only).
    pub fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            Inner::Pipe(s) => s.fd.as_raw_fd(),
            Inner::Socket(s) => s.fd.as_raw_fd(),
            Inner::File(s) => s.fd.as_raw_fd(),
        }
    }

    /// Reads at most one chunk from the resource.
    ///
    /// Regular files are never stream-read; a readability event against
    /// one is a protocol error reported as `EOPNOTSUPP`.
    pub fn read(&mut self) -> io::Result<StreamRead> {
        match &mut self.inner {
            Inner::Pipe(s) => s.read(),
            Inner::Socket(s) => s.read(),
            Inner::File(_) => Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
        }
    }

    /// Writes a payload (and, for sockets, transferred descriptors) to
    /// the resource.
    ///
    /// Pipe writes block until the whole blob is written or fail; socket
    /// writes queue on `EAGAIN` and are flushed from [`Stream::flush`].
    pub fn write(&mut self, blob: &[u8], fds: Vec<OwnedFd>) -> io::Result<()> {
        match &mut self.inner {
            Inner::Pipe(s) => {
                if !fds.is_empty() {
                    // Pipes cannot carry descriptors; dropping them here
                    // closes our ends and the peer sees EOF.
                    warn!(count = fds.len(), "discarding descriptors sent to a pipe handle");
                }
                s.write_all(blob)
            }
            Inner::Socket(s) => s.write(blob, fds),
            Inner::File(_) => Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
        }
    }

    /// Positional read. `None` means the resource kind does not support
    /// it; `Some((errno, bytes))` always answers, embedding any failure.
    pub fn pread(&self, count: u64, offset: u64) -> Option<(i32, Vec<u8>)> {
        match &self.inner {
            Inner::File(s) => Some(s.pread(count, offset)),
            Inner::Pipe(_) | Inner::Socket(_) => None,
        }
    }

    /// Size query. Same support contract as [`Stream::pread`].
    pub fn fstat(&self) -> Option<(i32, u64)> {
        match &self.inner {
            Inner::File(s) => Some(s.fstat()),
            Inner::Pipe(_) | Inner::Socket(_) => None,
        }
    }

    /// Readability interest for the poll set, or `None` for kinds that
    /// carry no watcher (regular files are always "readable" to poll and
    /// would spin the loop).
    pub fn poll_events(&self) -> Option<libc::c_short> {
        match &self.inner {
            Inner::Pipe(_) | Inner::Socket(_) => Some(libc::POLLIN),
            Inner::File(_) => None,
        }
    }

    /// Whether queued socket sends are waiting for writability.
    pub fn has_pending_writes(&self) -> bool {
        match &self.inner {
            Inner::Socket(s) => !s.queue.is_empty(),
            Inner::Pipe(_) | Inner::File(_) => false,
        }
    }

    /// Retries queued socket sends in order until drained or `EAGAIN`.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Socket(s) => s.flush(),
            Inner::Pipe(_) | Inner::File(_) => Ok(()),
        }
    }
}

/// One end of a pipe.
#[derive(Debug)]
struct PipeStream {
    /// The owned pipe descriptor.
    fd: OwnedFd,
}

impl PipeStream {
    /// Reads one chunk; zero bytes means the peer closed its end.
    fn read(&mut self) -> io::Result<StreamRead> {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            // SAFETY: buf is a valid writable buffer of CHUNK_SIZE bytes.
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => return Ok(StreamRead::WouldBlock),
                    _ => return Err(err),
                }
            }
            if n == 0 {
                return Ok(StreamRead::Closed);
            }
            return Ok(StreamRead::Data {
                blob: buf[..n as usize].to_vec(),
                fds: Vec::new(),
            });
        }
    }

    /// Writes the whole blob, retrying short writes and `EINTR`.
    fn write_all(&mut self, mut blob: &[u8]) -> io::Result<()> {
        while !blob.is_empty() {
            // SAFETY: blob is a valid readable buffer of blob.len() bytes.
            let n = unsafe {
                libc::write(self.fd.as_raw_fd(), blob.as_ptr().cast(), blob.len())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            blob = &blob[n as usize..];
        }
        Ok(())
    }
}

/// A queued socket send whose descriptors stay owned until delivered.
#[derive(Debug)]
struct PendingSend {
    /// Unsent payload bytes.
    blob: Vec<u8>,
    /// Descriptors to deliver with the first byte of `blob`.
    fds: Vec<OwnedFd>,
}

/// A connected stream socket, nonblocking, with an ordered send queue.
#[derive(Debug)]
struct SocketStream {
    /// The owned socket descriptor.
    fd: OwnedFd,
    /// Sends deferred by `EAGAIN`, flushed in FIFO order on writability.
    queue: VecDeque<PendingSend>,
}

impl SocketStream {
    /// Receives one chunk plus any ancillary descriptors.
    fn read(&mut self) -> io::Result<StreamRead> {
        let mut buf = [0u8; CHUNK_SIZE];
        let Some((n, fds)) = recv_with_fds(self.fd.as_raw_fd(), &mut buf)? else {
            return Ok(StreamRead::WouldBlock);
        };
        if n == 0 && fds.is_empty() {
            return Ok(StreamRead::Closed);
        }
        Ok(StreamRead::Data {
            blob: buf[..n].to_vec(),
            fds,
        })
    }

    /// Sends a payload with its descriptors, queueing on `EAGAIN`.
    ///
    /// Order is preserved: once anything is queued, later writes append
    /// behind it rather than racing past on a momentarily writable socket.
    fn write(&mut self, blob: &[u8], fds: Vec<OwnedFd>) -> io::Result<()> {
        if blob.is_empty() {
            if fds.is_empty() {
                return Ok(());
            }
            // SCM_RIGHTS needs at least one payload byte on a stream
            // socket; a descriptor with no data cannot be delivered.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot send descriptors with an empty payload",
            ));
        }
        if !self.queue.is_empty() {
            self.queue.push_back(PendingSend {
                blob: blob.to_vec(),
                fds,
            });
            return Ok(());
        }
        let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        match send_with_fds(self.fd.as_raw_fd(), blob, &raw_fds)? {
            None => {
                self.queue.push_back(PendingSend {
                    blob: blob.to_vec(),
                    fds,
                });
                Ok(())
            }
            Some(n) if n < blob.len() => {
                // Descriptors ride with the first byte; only the payload
                // tail remains. Our fd copies close when `fds` drops.
                self.queue.push_back(PendingSend {
                    blob: blob[n..].to_vec(),
                    fds: Vec::new(),
                });
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Retries queued sends in order until drained or `EAGAIN`.
    fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.queue.front_mut() {
            let raw_fds: Vec<RawFd> = front.fds.iter().map(AsRawFd::as_raw_fd).collect();
            match send_with_fds(self.fd.as_raw_fd(), &front.blob, &raw_fds)? {
                None => return Ok(()),
                Some(n) => {
                    front.fds.clear();
                    if n < front.blob.len() {
                        front.blob.drain(..n);
                    } else {
                        self.queue.pop_front();
                    }
                }
            }
        }
        Ok(())
    }
}

/// A read-only regular file; exists purely to answer `pread`/`fstat`.
#[derive(Debug)]
struct FileStream {
    /// The owned file descriptor.
    fd: OwnedFd,
}

impl FileStream {
    /// One positional read, clamped to end-of-file.
    ///
    /// Never fails at this level: an OS error becomes `(errno, empty)`.
    fn pread(&self, count: u64, offset: u64) -> (i32, Vec<u8>) {
        let want = count.min(MAX_PREAD) as usize;
        let mut buf = vec![0u8; want];
        loop {
            // SAFETY: buf is a valid writable buffer of `want` bytes.
            let n = unsafe {
                libc::pread(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return (err.raw_os_error().unwrap_or(libc::EIO), Vec::new());
            }
            buf.truncate(n as usize);
            return (0, buf);
        }
    }

    /// Reports the file size, embedding any OS error.
    fn fstat(&self) -> (i32, u64) {
        // SAFETY: zeroed stat is a valid out-parameter for fstat.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid for the lifetime of self.
        if unsafe { libc::fstat(self.fd.as_raw_fd(), &mut st) } < 0 {
            let err = io::Error::last_os_error();
            return (err.raw_os_error().unwrap_or(libc::EIO), 0);
        }
        (0, st.st_size as u64)
    }
}

/// Classifies a received ancillary descriptor by its `fstat` mode.
///
/// FIFOs are split by inherited open mode; anything that is neither a
/// FIFO nor a socket (or a FIFO opened read-write) is unforwardable and
/// reported as `None`.
pub fn classify_fd(fd: RawFd) -> io::Result<Option<FdKind>> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: classify is only called on descriptors we currently own.
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    match st.st_mode & libc::S_IFMT {
        libc::S_IFSOCK => Ok(Some(FdKind::Socket)),
        libc::S_IFIFO => {
            // SAFETY: F_GETFL on an owned descriptor.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            match flags & libc::O_ACCMODE {
                libc::O_RDONLY => Ok(Some(FdKind::PipeRead)),
                libc::O_WRONLY => Ok(Some(FdKind::PipeWrite)),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Creates a pipe pair as `(read_end, write_end)`, both close-on-exec.
pub fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    // SAFETY: pipe2 with a valid 2-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are valid after a successful pipe2.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a connected Unix stream socket pair, both ends close-on-exec.
pub fn socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];
    // SAFETY: socketpair with a valid 2-element array.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are valid after a successful socketpair.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Connects to a Unix stream socket at `path`.
pub fn unix_connect(path: &Path) -> io::Result<OwnedFd> {
    let (addr, len) = unix_addr(path)?;
    // SAFETY: socket() with constant arguments.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is valid after the check above.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: addr is a fully initialized sockaddr_un of length len.
    let ret = unsafe {
        libc::connect(fd.as_raw_fd(), std::ptr::from_ref(&addr).cast(), len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Binds and listens on a Unix stream socket at `path`, removing any
/// stale socket file first.
pub fn unix_listen(path: &Path) -> io::Result<OwnedFd> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let (addr, len) = unix_addr(path)?;
    // SAFETY: socket() with constant arguments.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: raw is valid after the check above.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: addr is a fully initialized sockaddr_un of length len.
    if unsafe { libc::bind(fd.as_raw_fd(), std::ptr::from_ref(&addr).cast(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a bound socket.
    if unsafe { libc::listen(fd.as_raw_fd(), 1) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Accepts one connection from a listening socket.
pub fn accept_one(listener: &OwnedFd) -> io::Result<OwnedFd> {
    loop {
        // SAFETY: accept on a valid listening socket; peer address unused.
        let raw = unsafe {
            libc::accept(listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
        };
        if raw < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        // SAFETY: raw is valid after the check above.
        return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
    }
}

/// Builds a `sockaddr_un` for `path`.
fn unix_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    // SAFETY: zeroed sockaddr_un is a valid all-fields-zero value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((addr, len))
}

/// Switches a descriptor to nonblocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on an owned descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Sends `blob` with an optional `SCM_RIGHTS` descriptor set.
///
/// Returns `Ok(None)` if the socket would block (nothing was sent), or
/// the number of payload bytes accepted. When any bytes are accepted the
/// descriptors have been delivered.
fn send_with_fds(fd: RawFd, blob: &[u8], fds: &[RawFd]) -> io::Result<Option<usize>> {
    debug_assert!(fds.len() <= MAX_TRANSFER_FDS);
    let mut iov = libc::iovec {
        iov_base: blob.as_ptr() as *mut libc::c_void,
        iov_len: blob.len(),
    };
    // SAFETY: zeroed msghdr is a valid all-fields-zero value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    if !fds.is_empty() {
        let data_len = std::mem::size_of_val(fds) as u32;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
        debug_assert!(space <= CMSG_BUF_LEN);
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space;
        // SAFETY: msg_control points at cmsg_buf, which is large enough
        // for one SCM_RIGHTS header plus `fds`.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as usize;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                fds.len(),
            );
        }
    }

    loop {
        // SAFETY: msg references live iov and control buffers.
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// Receives into `buf`, collecting any `SCM_RIGHTS` descriptors.
///
/// Returns `Ok(None)` if the socket would block. Received descriptors are
/// opened close-on-exec.
fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, Vec<OwnedFd>)>> {
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: zeroed msghdr is a valid all-fields-zero value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    let n = loop {
        // SAFETY: msg references live iov and control buffers.
        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err),
        }
    };

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control with well-formed cmsg headers;
    // CMSG_FIRSTHDR/CMSG_NXTHDR walk them within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
        }
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        // The kernel dropped descriptors that did not fit the control
        // buffer; a partial set must not be forwarded. The descriptors
        // collected above close when `fds` drops.
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary descriptor set truncated",
        ));
    }
    Ok(Some((n, fds)))
}
