//! Link bring-up: the vsock transport between host and guest, and the
//! rendezvous hand-off that mints the first proxied handle.
//!
//! The transport is a single `AF_VSOCK` stream. The host listens; the
//! guest dials with bounded exponential backoff, since its proxy almost
//! always starts before the host side is ready to accept. Once the
//! stream exists, each side hands it to [`Proxy::new`] and the wire
//! protocol takes over.
//!
//! The first handle is seeded through named Unix sockets rather than
//! descriptor transfer: the seeding side accepts one local client on
//! its rendezvous path, asks the peer to connect to the peer-side path,
//! and registers the accepted socket under whatever handle the peer
//! replied with. From then on, descriptors minted inside `Data`
//! messages carry all further channels.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use fdmux_proto::INVALID_HANDLE;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::stream::{self, StreamKind};

/// How many times the guest dials the host before giving up.
pub const CONNECT_ATTEMPTS: u32 = 8;

/// First retry delay; doubles per attempt up to [`CONNECT_MAX_DELAY`].
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling on the per-attempt retry delay.
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(3);

/// Delay before retry number `attempt` (zero-based).
fn backoff_delay(attempt: u32) -> Duration {
    CONNECT_BASE_DELAY
        .saturating_mul(1u32 << attempt.min(10))
        .min(CONNECT_MAX_DELAY)
}

/// Creates a vsock listener bound to `port` on any CID.
#[cfg(target_os = "linux")]
pub fn vsock_listen(port: u32) -> Result<OwnedFd> {
    use std::os::fd::{AsRawFd, FromRawFd};

    // SAFETY: plain socket/bind/listen syscalls; the descriptor is
    // wrapped in an OwnedFd as soon as socket() succeeds.
    unsafe {
        let raw = libc::socket(
            libc::AF_VSOCK,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        if raw < 0 {
            return Err(Error::Bootstrap {
                op: "vsock socket",
                source: io::Error::last_os_error(),
            });
        }
        let sock = OwnedFd::from_raw_fd(raw);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as u16;
        addr.svm_cid = libc::VMADDR_CID_ANY;
        addr.svm_port = port;

        if libc::bind(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(Error::Bootstrap {
                op: "vsock bind",
                source: io::Error::last_os_error(),
            });
        }

        if libc::listen(sock.as_raw_fd(), 1) < 0 {
            return Err(Error::Bootstrap {
                op: "vsock listen",
                source: io::Error::last_os_error(),
            });
        }

        Ok(sock)
    }
}

/// Accepts one transport connection from a vsock listener.
#[cfg(target_os = "linux")]
pub fn vsock_accept(listener: &OwnedFd) -> Result<OwnedFd> {
    use std::os::fd::{AsRawFd, FromRawFd};

    loop {
        // SAFETY: accept4 on a valid listening socket; peer address unused.
        let raw = unsafe {
            libc::accept4(
                listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if raw >= 0 {
            // SAFETY: accept4 returned a fresh, valid descriptor.
            return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Error::Bootstrap {
            op: "vsock accept",
            source: err,
        });
    }
}

/// One vsock connect attempt.
#[cfg(target_os = "linux")]
fn vsock_connect_once(cid: u32, port: u32) -> io::Result<OwnedFd> {
    use std::os::fd::{AsRawFd, FromRawFd};

    // SAFETY: socket/connect with a zero-initialized sockaddr_vm; the
    // descriptor is wrapped in an OwnedFd as soon as socket() succeeds.
    unsafe {
        let raw = libc::socket(
            libc::AF_VSOCK,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(raw);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as u16;
        addr.svm_cid = cid;
        addr.svm_port = port;

        if libc::connect(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }
}

/// Dials the host's vsock listener with bounded exponential backoff.
///
/// Gives up after [`CONNECT_ATTEMPTS`] tries and reports the last OS
/// error; an endlessly absent peer must surface as a startup failure,
/// not a silent hang.
#[cfg(target_os = "linux")]
pub fn vsock_connect(cid: u32, port: u32) -> Result<OwnedFd> {
    use tracing::debug;

    let mut last = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(backoff_delay(attempt - 1));
        }
        match vsock_connect_once(cid, port) {
            Ok(sock) => {
                info!(cid, port, attempt, "vsock transport connected");
                return Ok(sock);
            }
            Err(e) => {
                debug!(cid, port, attempt, error = %e, "vsock connect attempt failed");
                last = Some(e);
            }
        }
    }
    Err(Error::Bootstrap {
        op: "vsock connect",
        source: last.unwrap_or_else(|| io::ErrorKind::TimedOut.into()),
    })
}

/// What the seeding exchange produced: the seeded handle, or the errno
/// the peer (or the local registration) failed with.
pub type SeedOutcome = std::result::Result<u64, i32>;

/// Seeds the first proxied handle over the rendezvous paths.
///
/// Listens on `local_path`, blocks for exactly one local client, then
/// asks the peer to connect to `remote_path`. The accepted socket is
/// registered under the handle the peer replies with, so both sides
/// agree on the number without a separate allocation protocol. Must be
/// called before [`Proxy::run`]; registration completes inside the
/// event loop when the peer's response arrives.
///
/// The returned receiver yields exactly one [`SeedOutcome`] once the
/// exchange resolves. Callers drive [`Proxy::run`] on another thread
/// and wait on it; a rejected seed is a startup failure, not something
/// to proxy past. Link death before the response resolves the outcome
/// as `ECONNRESET` (or disconnects the channel if the proxy is gone).
pub fn seed_initial_handle(
    proxy: &mut Proxy,
    local_path: &Path,
    remote_path: &str,
) -> Result<Receiver<SeedOutcome>> {
    let listener = stream::unix_listen(local_path).map_err(|e| Error::Bootstrap {
        op: "rendezvous listen",
        source: e,
    })?;
    info!(path = %local_path.display(), "waiting for initial local client");
    let conn = stream::accept_one(&listener).map_err(|e| Error::Bootstrap {
        op: "rendezvous accept",
        source: e,
    })?;

    let (tx, rx) = mpsc::sync_channel(1);
    proxy.connect(
        remote_path,
        Box::new(move |proxy, errno, handle| {
            if errno != 0 {
                warn!(errno, "peer rejected rendezvous connect");
                let _ = tx.send(Err(errno));
                return;
            }
            if proxy.register_fd(conn, StreamKind::Socket, handle) == INVALID_HANDLE {
                warn!(handle, "failed to register rendezvous socket");
                let _ = tx.send(Err(libc::EIO));
            } else {
                info!(handle, "initial handle seeded");
                let _ = tx.send(Ok(handle));
            }
        }),
    );
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;
    use crate::proxy::{Proxy, Side};

    #[test]
    fn backoff_doubles_then_saturates() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(5), Duration::from_secs(3));
        assert_eq!(backoff_delay(30), Duration::from_secs(3));
    }

    #[test]
    fn total_retry_time_is_bounded() {
        let total: Duration = (0..CONNECT_ATTEMPTS - 1).map(backoff_delay).sum();
        assert!(total < Duration::from_secs(30));
    }

    #[test]
    fn seeding_connects_both_rendezvous_paths() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("host.sock");
        let remote_path = dir.path().join("guest.sock");

        // Stands in for the service the peer-side ConnectRequest reaches.
        let service = stream::unix_listen(&remote_path).unwrap();

        let (ta, tb) = stream::socket_pair().unwrap();
        let mut proxy_a = Proxy::new(ta, Side::Guest).unwrap();
        let mut proxy_b = Proxy::new(tb, Side::Host).unwrap();
        let ha = proxy_a.handle();
        let hb = proxy_b.handle();

        let jb = std::thread::spawn(move || {
            let _ = proxy_b.run();
        });

        // The local client dials once the listener inside
        // seed_initial_handle exists.
        let client_path = local_path.clone();
        let client = std::thread::spawn(move || {
            let conn = loop {
                match stream::unix_connect(&client_path) {
                    Ok(c) => break c,
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            };
            let mut sock = UnixStream::from(conn);
            sock.write_all(b"hello").unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).unwrap();
            buf
        });

        let seeded =
            seed_initial_handle(&mut proxy_a, &local_path, remote_path.to_str().unwrap()).unwrap();
        let ja = std::thread::spawn(move || {
            let _ = proxy_a.run();
        });

        // The peer allocated the handle, so it carries the host bit.
        let handle = seeded
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_ne!(handle & (1 << 62), 0);

        // The peer connected here in response to the seed; speak
        // through the proxied channel in both directions.
        let mut remote = UnixStream::from(stream::accept_one(&service).unwrap());
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        remote.write_all(b"pong").unwrap();

        assert_eq!(&client.join().unwrap(), b"pong");

        ha.shutdown();
        hb.shutdown();
        ja.join().unwrap();
        jb.join().unwrap();
    }

    #[test]
    fn seeding_failure_reaches_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("host.sock");
        // Nothing ever listens on the peer-side path.
        let missing_path = dir.path().join("missing.sock");

        let (ta, tb) = stream::socket_pair().unwrap();
        let mut proxy_a = Proxy::new(ta, Side::Guest).unwrap();
        let mut proxy_b = Proxy::new(tb, Side::Host).unwrap();
        let ha = proxy_a.handle();
        let hb = proxy_b.handle();

        let jb = std::thread::spawn(move || {
            let _ = proxy_b.run();
        });

        let client_path = local_path.clone();
        let client = std::thread::spawn(move || {
            let conn = loop {
                match stream::unix_connect(&client_path) {
                    Ok(c) => break c,
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            };
            // The rejected seed drops the accepted end; observe EOF.
            let mut sock = UnixStream::from(conn);
            let mut buf = [0u8; 1];
            let _ = sock.read(&mut buf);
        });

        let seeded =
            seed_initial_handle(&mut proxy_a, &local_path, missing_path.to_str().unwrap())
                .unwrap();
        let ja = std::thread::spawn(move || {
            let _ = proxy_a.run();
        });

        let errno = seeded
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap_err();
        assert_ne!(errno, 0);

        ha.shutdown();
        hb.shutdown();
        ja.join().unwrap();
        jb.join().unwrap();
        client.join().unwrap();
    }
}
