//! Protocol message types for the multiplexed descriptor link.
//!
//! A **handle** is an unsigned identifier (always below 2^63) naming a
//! socket, pipe end, or regular file on one side of the link. Handles are
//! meaningful only in messages addressed *by the other side*: each peer
//! keeps its own handle→descriptor table and never interprets a handle it
//! generated itself. A **cookie** pairs an RPC-style request with its
//! response and is otherwise opaque; the responder echoes it unchanged.

use serde::{Deserialize, Serialize};

/// Default vsock port for the multiplexer transport.
pub const MUX_PORT: u32 = 1026;

/// Rendezvous Unix socket path on the host side, used once at bootstrap.
pub const HOST_RENDEZVOUS_PATH: &str = "/run/fdmux/host.sock";

/// Rendezvous Unix socket path on the guest side, used once at bootstrap.
pub const GUEST_RENDEZVOUS_PATH: &str = "/run/fdmux/guest.sock";

/// The handle value that never names a resource.
///
/// Returned by failed registrations and carried in error responses.
pub const INVALID_HANDLE: u64 = 0;

/// Kind of a file descriptor transferred alongside socket data.
///
/// Pipe ends carry their direction so the receiving side can synthesize a
/// pair with matching semantics; sockets are always bidirectional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdKind {
    /// A connected stream socket end.
    Socket,
    /// The read end of a pipe.
    PipeRead,
    /// The write end of a pipe.
    PipeWrite,
}

/// A file descriptor that accompanied a [`Message::Data`] payload.
///
/// The sender registered the descriptor locally under `handle` before
/// emitting this; the receiver must register its synthesized local end
/// under the *same* handle so both sides address one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdDescriptor {
    /// Handle the sender registered the original descriptor under.
    pub handle: u64,
    /// What to synthesize on the receiving side.
    pub kind: FdKind,
}

/// One frame of the multiplexed link.
///
/// `error` fields carry a raw OS errno (`0` = success); failures of an
/// addressed operation are always reported in the response, never by
/// staying silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Message {
    /// Stream payload for a registered handle, with any descriptors that
    /// rode along on the local socket.
    ///
    /// A zero-length `blob` is a valid (if unusual) payload. Earlier
    /// revisions of this protocol overloaded it as a close signal; close
    /// is now always the explicit [`Message::Close`].
    Data {
        /// Destination handle on the receiving side.
        handle: u64,
        /// Raw bytes read from the sender's local descriptor.
        blob: Vec<u8>,
        /// Descriptors extracted from the sender's local socket.
        fds: Vec<FdDescriptor>,
    },
    /// The sender's local end of `handle` closed or failed; the receiver
    /// must tear down its own end.
    Close {
        /// Handle whose peer descriptor is gone.
        handle: u64,
    },
    /// Ask the receiver to `connect(2)` to a Unix socket on *its* side.
    ConnectRequest {
        /// Pairs the eventual [`Message::ConnectResponse`].
        cookie: u64,
        /// Unix socket path on the receiving side.
        path: String,
    },
    /// Outcome of a [`Message::ConnectRequest`].
    ConnectResponse {
        /// Echoed request cookie.
        cookie: u64,
        /// OS errno, `0` on success.
        error: i32,
        /// Handle the responder registered the new socket under, or
        /// [`INVALID_HANDLE`] on failure.
        handle: u64,
    },
    /// Positional read against a regular file registered on the receiver.
    PreadRequest {
        /// Pairs the eventual [`Message::PreadResponse`].
        cookie: u64,
        /// Handle of the remote regular file.
        handle: u64,
        /// Maximum number of bytes to read.
        count: u64,
        /// Absolute file offset.
        offset: u64,
    },
    /// Outcome of a [`Message::PreadRequest`]. A short or empty `blob`
    /// with `error == 0` means the read hit end-of-file.
    PreadResponse {
        /// Echoed request cookie.
        cookie: u64,
        /// OS errno, `0` on success.
        error: i32,
        /// Bytes read.
        blob: Vec<u8>,
    },
    /// Size query against a regular file registered on the receiver.
    FstatRequest {
        /// Pairs the eventual [`Message::FstatResponse`].
        cookie: u64,
        /// Handle of the remote regular file.
        handle: u64,
    },
    /// Outcome of a [`Message::FstatRequest`].
    FstatResponse {
        /// Echoed request cookie.
        cookie: u64,
        /// OS errno, `0` on success.
        error: i32,
        /// File size in bytes.
        size: u64,
    },
}
