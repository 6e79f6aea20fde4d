//! IPC primitives backed by file-system artefacts.
//!
//! All primitives share one pattern: a directory holds a data file, an
//! advisory lock file and a JSON metadata sidecar. Threads of the owning
//! process coordinate through a mutex plus condition variables; unrelated
//! processes coordinate through an exclusive `flock` on the lock file held
//! for the duration of each critical section. Blocking operations wait on
//! the condition variables with a one second timeout and recheck the
//! on-disk state, which doubles as the cross-process poll.

mod lockfile;
pub mod message_queue;
pub mod pipe;
pub mod semaphore;
pub mod shared_memory;
pub mod signals;

pub use lockfile::{LockFile, LockGuard};
pub use message_queue::{Message, MessageQueue, MessageQueueRegistry};
pub use pipe::{Pipe, PipeRegistry};
pub use semaphore::{Semaphore, SemaphoreRegistry};
pub use shared_memory::{SharedMemory, SharedMemoryRegistry};
pub use signals::SignalTable;

#[derive(Debug)]
pub enum IpcError {
    NotFound(String),
    AlreadyExists(String),
    Closed(String),
    /// A nonblocking operation found the primitive full or empty.
    WouldBlock,
    /// A blocking operation ran out its timeout budget.
    Timeout,
    InvalidArgument(String),
    LimitExceeded(String),
    /// The on-disk artefact failed validation (bad magic, bad version, short file).
    Corrupt(String),
    Lock(nix::errno::Errno),
    Io(std::io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(fmt, "no such ipc object: {id}"),
            Self::AlreadyExists(id) => write!(fmt, "ipc object already exists: {id}"),
            Self::Closed(id) => write!(fmt, "ipc object is closed: {id}"),
            Self::WouldBlock => write!(fmt, "operation would block"),
            Self::Timeout => write!(fmt, "operation timed out"),
            Self::InvalidArgument(msg) => write!(fmt, "invalid argument: {msg}"),
            Self::LimitExceeded(msg) => write!(fmt, "limit exceeded: {msg}"),
            Self::Corrupt(msg) => write!(fmt, "corrupt ipc state: {msg}"),
            Self::Lock(errno) => write!(fmt, "advisory lock failed: {errno}"),
            Self::Io(err) => write!(fmt, "io error: {err}"),
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::Io(err)
        }
    }
}

/// Seconds since the Unix epoch as an f64, the unit used by the binary
/// header timestamps.
pub(crate) fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Little-endian u32 accessors for the fixed-offset headers of the
/// mmap-backed primitives.
pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
