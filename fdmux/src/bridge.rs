//! Remote-file bridge: a private FUSE mount that turns handles for
//! regular files on the *other* side of the link into ordinary local
//! read-only file descriptors.
//!
//! Passing a regular file's descriptor across a VM boundary is
//! meaningless (no shared kernel file table), so each remote file is
//! instead published as `/<handle>` under a private mount point. The
//! filesystem callbacks run on fuser's own thread and bridge into the
//! proxy thread through [`ProxyHandle`]: `read` and post-open `getattr`
//! block on a Pread/Fstat RPC; `release` posts a fire-and-forget Close.
//!
//! The only state shared between the two threads is the small
//! handle→(size, opened) map behind a mutex, consulted by callbacks that
//! must answer without a round trip. The important case is the `getattr`
//! issued by the very `open` that [`Bridge::register_handle`] performs,
//! which would deadlock if it had to wait on the proxy.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FUSE_ROOT_ID, FileAttr, FileType, Filesystem, MountOption, ReplyAttr,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use tracing::{debug, warn};

use crate::proxy::ProxyHandle;

/// Kernel attribute cache lifetime for synthetic entries.
const TTL: Duration = Duration::from_secs(1);

/// A registered remote file as the filesystem callbacks see it.
#[derive(Debug, Clone, Copy)]
struct RemoteFile {
    /// Size cached at registration time; answers pre-open stats.
    size: u64,
    /// Whether the synthetic path has been opened.
    opened: bool,
}

/// The lock-protected handle map shared with the filesystem thread.
#[derive(Debug, Default)]
struct BridgeState {
    /// handle → remote file record.
    files: Mutex<HashMap<u64, RemoteFile>>,
}

impl BridgeState {
    /// Poison-tolerant lock; the map stays usable if a callback panicked.
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, RemoteFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a remote file. `false` if the handle is already present.
    fn register(&self, handle: u64, size: u64) -> bool {
        let mut files = self.lock();
        if files.contains_key(&handle) {
            return false;
        }
        files.insert(
            handle,
            RemoteFile {
                size,
                opened: false,
            },
        );
        true
    }

    /// Removes a remote file record.
    fn remove(&self, handle: u64) {
        self.lock().remove(&handle);
    }

    /// Snapshot of one record.
    fn entry(&self, handle: u64) -> Option<RemoteFile> {
        self.lock().get(&handle).copied()
    }

    /// Marks a registered handle opened. `false` for unknown handles.
    fn mark_opened(&self, handle: u64) -> bool {
        match self.lock().get_mut(&handle) {
            Some(file) => {
                file.opened = true;
                true
            }
            None => false,
        }
    }
}

/// Parses a root-directory entry name as a decimal handle.
fn handle_for_name(name: &OsStr) -> Option<u64> {
    name.to_str()?.parse::<u64>().ok()
}

/// Synthetic-path inode for a handle. Root is [`FUSE_ROOT_ID`] (1) and
/// handle 0 is invalid, so `handle + 1` never collides.
fn inode_for_handle(handle: u64) -> u64 {
    handle + 1
}

/// Attributes of a synthetic regular file.
fn file_attr(ino: u64, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0o444,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Attributes of the mount root.
fn dir_attr() -> FileAttr {
    FileAttr {
        ino: FUSE_ROOT_ID,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// The fuser filesystem: pure addressing, no real hierarchy.
struct RemoteFs {
    /// Bridge into the proxy thread for Pread/Fstat/Close.
    proxy: ProxyHandle,
    /// Shared handle map.
    state: Arc<BridgeState>,
}

impl Filesystem for RemoteFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(handle) = handle_for_name(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.state.entry(handle) {
            Some(file) => reply.entry(&TTL, &file_attr(inode_for_handle(handle), file.size), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &dir_attr());
            return;
        }
        let handle = ino - 1;
        let Some(file) = self.state.entry(handle) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !file.opened {
            // Pre-open stat: answered from the cached size so the open
            // inside register_handle cannot deadlock against itself.
            reply.attr(&TTL, &file_attr(ino, file.size));
            return;
        }
        let (error, size) = self.proxy.fstat_blocking(handle);
        if error != 0 {
            reply.error(error);
            return;
        }
        reply.attr(&TTL, &file_attr(ino, size));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let handle = ino - 1;
        if self.state.mark_opened(handle) {
            reply.opened(0, 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handle = ino - 1;
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(file) = self.state.entry(handle) else {
            reply.error(libc::ENOENT);
            return;
        };
        // At or past the cached size: zero bytes without a round trip.
        if offset as u64 >= file.size {
            reply.data(&[]);
            return;
        }
        let (error, blob) = self
            .proxy
            .pread_blocking(handle, u64::from(size), offset as u64);
        if error != 0 {
            warn!(handle, error, "remote pread failed");
            reply.error(error);
            return;
        }
        reply.data(&blob);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = ino - 1;
        debug!(handle, "releasing remote file");
        self.state.remove(handle);
        // Fire-and-forget: release must not block on the proxy.
        self.proxy.close(handle);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != FUSE_ROOT_ID {
            reply.error(libc::ENOTDIR);
            return;
        }
        // Addressing mechanism, not a browsable hierarchy: only . and ..
        let entries = [(FUSE_ROOT_ID, "."), (FUSE_ROOT_ID, "..")];
        for (i, (entry_ino, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, FileType::Directory, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// A mounted remote-file bridge.
///
/// Unmounts when dropped (the background fuser session ends).
pub struct Bridge {
    /// Where the synthetic filesystem is mounted.
    mount_point: PathBuf,
    /// Shared handle map.
    state: Arc<BridgeState>,
    /// Keeps the fuser session (and its worker thread) alive.
    _session: BackgroundSession,
}

impl Bridge {
    /// Mounts the synthetic filesystem at `mount_point`, creating the
    /// directory if needed. The filesystem engine runs on its own
    /// thread; it never blocks the proxy thread, since all interaction
    /// goes through `proxy`'s task queue.
    pub fn mount(mount_point: impl Into<PathBuf>, proxy: ProxyHandle) -> io::Result<Self> {
        let mount_point = mount_point.into();
        std::fs::create_dir_all(&mount_point)?;
        let state = Arc::new(BridgeState::default());
        let fs = RemoteFs {
            proxy,
            state: Arc::clone(&state),
        };
        let session = fuser::spawn_mount2(
            fs,
            &mount_point,
            &[
                MountOption::RO,
                MountOption::FSName("fdmux".to_owned()),
                MountOption::DefaultPermissions,
            ],
        )?;
        debug!(mount_point = %mount_point.display(), "remote-file bridge mounted");
        Ok(Self {
            mount_point,
            state,
            _session: session,
        })
    }

    /// Where the bridge is mounted.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Publishes a remote file handle and mints an ordinary local
    /// read-only descriptor for it.
    ///
    /// `size` seeds the pre-open attribute cache. Fails with
    /// `AlreadyExists` if the handle was registered before; handles are
    /// registered at most once per bridge lifetime.
    pub fn register_handle(&self, handle: u64, size: u64) -> io::Result<File> {
        if !self.state.register(handle, size) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "handle already registered with the bridge",
            ));
        }
        let path = self.mount_point.join(handle.to_string());
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(e) => {
                self.state.remove(handle);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}
