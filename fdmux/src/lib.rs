//! File-descriptor multiplexing proxy between a guest VM and its host.
//!
//! `fdmux` forwards Unix descriptor semantics across a single vsock
//! byte stream: sockets and pipes become numbered *handles* whose
//! traffic is interleaved as framed messages, and regular files are
//! re-materialized on the far side through a private FUSE mount that
//! answers reads with positional-read RPCs. One proxy process runs on
//! each side of the link; neither side is privileged over the other
//! once the transport exists.
//!
//! # Quick start — guest side
//!
//! ```no_run
//! use std::path::Path;
//!
//! let transport = fdmux::vsock_connect(libc::VMADDR_CID_HOST, fdmux::MUX_PORT)?;
//! let mut proxy = fdmux::Proxy::new(transport, fdmux::Side::Guest)?;
//! let _seeded = fdmux::seed_initial_handle(
//!     &mut proxy,
//!     Path::new(fdmux::GUEST_RENDEZVOUS_PATH),
//!     fdmux::HOST_RENDEZVOUS_PATH,
//! )?;
//! proxy.run()?;
//! # Ok::<(), fdmux::Error>(())
//! ```

mod bootstrap;
#[cfg(target_os = "linux")]
mod bridge;
mod error;
mod proxy;
mod stream;

pub use bootstrap::{CONNECT_ATTEMPTS, SeedOutcome, seed_initial_handle};
#[cfg(target_os = "linux")]
pub use bootstrap::{vsock_accept, vsock_connect, vsock_listen};
#[cfg(target_os = "linux")]
pub use bridge::Bridge;
pub use error::{Error, Result};
pub use fdmux_proto::{
    FdDescriptor, FdKind, GUEST_RENDEZVOUS_PATH, HOST_RENDEZVOUS_PATH, INVALID_HANDLE, MUX_PORT,
    Message,
};
pub use proxy::{ConnectCallback, FstatCallback, PreadCallback, Proxy, ProxyHandle, Side};
pub use stream::{Stream, StreamKind, accept_one, classify_fd, socket_pair, unix_connect, unix_listen};
