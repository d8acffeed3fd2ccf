//! Wire protocol for the fdmux host↔guest descriptor proxy.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix, suitable for any reliable byte stream
//! (vsock, Unix socket, TCP). Both sides of the link speak the same
//! [`Message`] schema; directionality comes only from which side a
//! handle names a resource on.

mod codec;
mod message;

pub use codec::{decode, encode};
pub use message::{
    FdDescriptor, FdKind, GUEST_RENDEZVOUS_PATH, HOST_RENDEZVOUS_PATH, INVALID_HANDLE, MUX_PORT,
    Message,
};
