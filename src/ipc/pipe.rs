//! Unidirectional byte pipe over a memory-mapped file.
//!
//! The backing file starts with a 128 byte header followed by the ring
//! buffer. One slot is always left free so `read_pos == write_pos` means
//! empty and `(write_pos + 1) % buffer_size == read_pos` means full. The
//! `closed` flag in the header is monotone: once set it never clears, and
//! every other attached process observes it on its next operation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use super::{read_u32, write_u32, IpcError, LockFile};
use crate::persist;

pub const HEADER_SIZE: usize = 128;
pub const MAGIC: &[u8; 4] = b"KPIP";
pub const VERSION: u32 = 1;

const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_BUFFER_SIZE: usize = 12;
const OFF_READ_POS: usize = 16;
const OFF_WRITE_POS: usize = 20;
const OFF_READER_COUNT: usize = 24;
const OFF_WRITER_COUNT: usize = 28;
const OFF_LAST_ERROR: usize = 32;

const FLAG_CLOSED: u32 = 1;
const FLAG_ERROR: u32 = 2;

/// How long a blocking operation sleeps before rechecking the header.
/// Doubles as the cross-process poll interval.
const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct PipeMeta {
    pipe_id: String,
    name: String,
    buffer_size: u32,
    created: String,
    creator_pid: u32,
}

struct PipeInner {
    map: MmapMut,
    closed: bool,
    error: bool,
}

/// Header error code for a failed advisory lock or I/O path.
fn lock_error_code(err: &IpcError) -> u32 {
    match err {
        IpcError::Lock(errno) => (*errno as i32) as u32,
        IpcError::Io(io) => io.raw_os_error().unwrap_or(libc::EIO) as u32,
        _ => libc::EIO as u32,
    }
}

pub struct Pipe {
    pub id: String,
    pub name: String,
    pub buffer_size: u32,
    data_path: PathBuf,
    meta_path: PathBuf,
    lock_path: PathBuf,
    lock_file: LockFile,
    inner: Mutex<PipeInner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Pipe {
    /// Create a new pipe under `dir` and attach to it as one reader/writer.
    pub fn create(dir: &Path, name: Option<String>, buffer_size: u32) -> Result<Self, IpcError> {
        if buffer_size == 0 {
            return Err(IpcError::InvalidArgument(
                "pipe buffer_size must be greater than zero".into(),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("pipe_{id}"));
        let data_path = dir.join(format!("{id}.pipe"));
        let meta_path = dir.join(format!("{id}.meta"));
        let lock_path = dir.join(format!("{id}.lock"));

        let meta = PipeMeta {
            pipe_id: id.clone(),
            name: name.clone(),
            buffer_size,
            created: chrono::Utc::now().to_rfc3339(),
            creator_pid: std::process::id(),
        };
        persist::write_json_atomic(&meta_path, &meta)?;
        let lock_file = LockFile::ensure(lock_path.clone())?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;
        file.set_len((HEADER_SIZE + buffer_size as usize) as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(IpcError::Io)?;

        map[0..4].copy_from_slice(MAGIC);
        write_u32(&mut map, OFF_VERSION, VERSION);
        write_u32(&mut map, OFF_FLAGS, 0);
        write_u32(&mut map, OFF_BUFFER_SIZE, buffer_size);
        write_u32(&mut map, OFF_READ_POS, 0);
        write_u32(&mut map, OFF_WRITE_POS, 0);
        write_u32(&mut map, OFF_READER_COUNT, 1);
        write_u32(&mut map, OFF_WRITER_COUNT, 1);
        write_u32(&mut map, OFF_LAST_ERROR, 0);

        debug!("Created pipe {id} ({name})");
        Ok(Self {
            id,
            name,
            buffer_size,
            data_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(PipeInner {
                map,
                closed: false,
                error: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Attach to an existing pipe, reconstructing the view from disk.
    pub fn open(dir: &Path, id: &str) -> Result<Self, IpcError> {
        let meta_path = dir.join(format!("{id}.meta"));
        let meta: PipeMeta = persist::read_json(&meta_path)
            .map_err(|_| IpcError::NotFound(format!("pipe {id}")))?;
        let data_path = dir.join(format!("{id}.pipe"));
        let lock_path = dir.join(format!("{id}.lock"));
        let lock_file = LockFile::ensure(lock_path.clone())?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(IpcError::Io)?;
        if &map[0..4] != MAGIC {
            return Err(IpcError::Corrupt(format!("pipe {id}: bad magic")));
        }
        if read_u32(&map, OFF_VERSION) != VERSION {
            return Err(IpcError::Corrupt(format!("pipe {id}: unsupported version")));
        }

        let closed;
        let error;
        {
            let _guard = lock_file.lock()?;
            let flags = read_u32(&map, OFF_FLAGS);
            closed = flags & FLAG_CLOSED != 0;
            error = flags & FLAG_ERROR != 0;
            if !closed {
                let readers = read_u32(&map, OFF_READER_COUNT);
                let writers = read_u32(&map, OFF_WRITER_COUNT);
                write_u32(&mut map, OFF_READER_COUNT, readers + 1);
                write_u32(&mut map, OFF_WRITER_COUNT, writers + 1);
            }
        }

        debug!("Opened pipe {id} ({})", meta.name);
        Ok(Self {
            id: id.to_string(),
            name: meta.name,
            buffer_size: meta.buffer_size,
            data_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(PipeInner { map, closed, error }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    fn space_available(map: &[u8]) -> usize {
        let buffer_size = read_u32(map, OFF_BUFFER_SIZE) as usize;
        let read_pos = read_u32(map, OFF_READ_POS) as usize;
        let write_pos = read_u32(map, OFF_WRITE_POS) as usize;
        if read_pos > write_pos {
            read_pos - write_pos - 1
        } else if read_pos == 0 {
            buffer_size - write_pos - 1
        } else {
            buffer_size - write_pos + read_pos - 1
        }
    }

    fn data_available(map: &[u8]) -> usize {
        let buffer_size = read_u32(map, OFF_BUFFER_SIZE) as usize;
        let read_pos = read_u32(map, OFF_READ_POS) as usize;
        let write_pos = read_u32(map, OFF_WRITE_POS) as usize;
        if write_pos >= read_pos {
            write_pos - read_pos
        } else {
            buffer_size - read_pos + write_pos
        }
    }

    /// Copy `count` bytes from `data` into the ring. Wrap-around needs at
    /// most two contiguous copies.
    fn push_bytes(map: &mut MmapMut, data: &[u8], count: usize) {
        let buffer_size = read_u32(map, OFF_BUFFER_SIZE) as usize;
        let write_pos = read_u32(map, OFF_WRITE_POS) as usize;
        let first = count.min(buffer_size - write_pos);
        map[HEADER_SIZE + write_pos..HEADER_SIZE + write_pos + first]
            .copy_from_slice(&data[..first]);
        let rest = count - first;
        if rest > 0 {
            map[HEADER_SIZE..HEADER_SIZE + rest].copy_from_slice(&data[first..count]);
        }
        write_u32(map, OFF_WRITE_POS, ((write_pos + count) % buffer_size) as u32);
    }

    fn pull_bytes(map: &mut MmapMut, count: usize) -> Vec<u8> {
        let buffer_size = read_u32(map, OFF_BUFFER_SIZE) as usize;
        let read_pos = read_u32(map, OFF_READ_POS) as usize;
        let mut out = Vec::with_capacity(count);
        let first = count.min(buffer_size - read_pos);
        out.extend_from_slice(&map[HEADER_SIZE + read_pos..HEADER_SIZE + read_pos + first]);
        let rest = count - first;
        if rest > 0 {
            out.extend_from_slice(&map[HEADER_SIZE..HEADER_SIZE + rest]);
        }
        write_u32(map, OFF_READ_POS, ((read_pos + count) % buffer_size) as u32);
        out
    }

    /// Drop the pipe into the error state: both flags set in the header,
    /// error code recorded, waiters woken. Runs without the advisory lock
    /// because this path exists for when that lock is already gone.
    fn mark_error(&self, inner: &mut PipeInner, code: u32) {
        let flags = read_u32(&inner.map, OFF_FLAGS);
        write_u32(&mut inner.map, OFF_FLAGS, flags | FLAG_ERROR | FLAG_CLOSED);
        write_u32(&mut inner.map, OFF_LAST_ERROR, code);
        inner.closed = true;
        inner.error = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        warn!("pipe {} entered the error state (code {code})", self.id);
    }

    /// Write up to `data.len()` bytes. Returns the number of bytes copied,
    /// which is `min(len, space)` once any space is available. Blocks only
    /// while the ring is completely full; a zero-length write and a write
    /// to a closed pipe both return 0 immediately. A pipe in the error
    /// state fails every write.
    pub fn write(&self, data: &[u8], nonblocking: bool) -> Result<usize, IpcError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.error {
                return Err(IpcError::Closed(format!("pipe {} is in the error state", self.id)));
            }
            if inner.closed {
                return Ok(0);
            }
            {
                let _guard = match self.lock_file.lock() {
                    Ok(guard) => guard,
                    Err(err) => {
                        self.mark_error(&mut inner, lock_error_code(&err));
                        return Err(err);
                    }
                };
                if read_u32(&inner.map, OFF_FLAGS) & FLAG_CLOSED != 0 {
                    inner.closed = true;
                    return Ok(0);
                }
                let space = Self::space_available(&inner.map);
                if space > 0 {
                    let count = data.len().min(space);
                    Self::push_bytes(&mut inner.map, data, count);
                    drop(_guard);
                    self.not_empty.notify_all();
                    trace!("pipe {}: wrote {count} bytes", self.id);
                    return Ok(count);
                }
            }
            if nonblocking {
                return Ok(0);
            }
            let (guard, _) = self.not_full.wait_timeout(inner, WAIT_SLICE).unwrap();
            inner = guard;
        }
    }

    /// Read up to `size` bytes. Returns an empty buffer immediately when
    /// `size` is 0 or when the pipe is closed and drained; fails when the
    /// pipe is in the error state.
    pub fn read(&self, size: usize, nonblocking: bool) -> Result<Vec<u8>, IpcError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.error {
                return Err(IpcError::Closed(format!("pipe {} is in the error state", self.id)));
            }
            {
                let _guard = match self.lock_file.lock() {
                    Ok(guard) => guard,
                    Err(err) => {
                        self.mark_error(&mut inner, lock_error_code(&err));
                        return Err(err);
                    }
                };
                let closed = inner.closed || read_u32(&inner.map, OFF_FLAGS) & FLAG_CLOSED != 0;
                let available = Self::data_available(&inner.map);
                if available > 0 {
                    let count = size.min(available);
                    let out = Self::pull_bytes(&mut inner.map, count);
                    drop(_guard);
                    self.not_full.notify_all();
                    trace!("pipe {}: read {count} bytes", self.id);
                    return Ok(out);
                }
                if closed {
                    return Ok(Vec::new());
                }
            }
            if nonblocking {
                return Ok(Vec::new());
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, WAIT_SLICE).unwrap();
            inner = guard;
        }
    }

    /// Set the closed flag and drop this handle's reader/writer slots.
    /// Idempotent; waiters are woken so they can observe the flag. Close
    /// stays valid even when the advisory lock is gone: the pipe is then
    /// marked failed and closed anyway.
    pub fn close(&self) -> Result<(), IpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        match self.lock_file.lock() {
            Ok(_guard) => {
                let flags = read_u32(&inner.map, OFF_FLAGS);
                write_u32(&mut inner.map, OFF_FLAGS, flags | FLAG_CLOSED);
                let readers = read_u32(&inner.map, OFF_READER_COUNT);
                let writers = read_u32(&inner.map, OFF_WRITER_COUNT);
                write_u32(&mut inner.map, OFF_READER_COUNT, readers.saturating_sub(1));
                write_u32(&mut inner.map, OFF_WRITER_COUNT, writers.saturating_sub(1));
                let _ = inner.map.flush();
            }
            Err(err) => {
                warn!("pipe {}: lock lost during close: {err}", self.id);
                self.mark_error(&mut inner, lock_error_code(&err));
            }
        }
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        debug!("Closed pipe {} ({})", self.id, self.name);
        Ok(())
    }

    /// Mark the pipe failed. All subsequent reads and writes fail;
    /// `close` remains valid.
    pub fn set_error(&self, code: u32) {
        let mut inner = self.inner.lock().unwrap();
        self.mark_error(&mut inner, code);
    }

    /// True once no attached reader or writer remains.
    pub fn unused(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        read_u32(&inner.map, OFF_READER_COUNT) == 0 && read_u32(&inner.map, OFF_WRITER_COUNT) == 0
    }

    fn remove_files(&self) {
        for path in &[&self.data_path, &self.meta_path, &self.lock_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Owner of every pipe this process knows about. Looking up an id that is
/// not in memory falls back to attaching from disk, so unrelated processes
/// can rendezvous by id.
pub struct PipeRegistry {
    dir: PathBuf,
    pipes: Mutex<HashMap<String, Arc<Pipe>>>,
}

impl PipeRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            pipes: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, name: Option<String>, buffer_size: u32) -> Result<String, IpcError> {
        let pipe = Pipe::create(&self.dir, name, buffer_size)?;
        let id = pipe.id.clone();
        self.pipes.lock().unwrap().insert(id.clone(), Arc::new(pipe));
        Ok(id)
    }

    /// Attach to an existing pipe by id. A no-op if it is already open here.
    pub fn open(&self, id: &str) -> Result<(), IpcError> {
        self.get(id).map(|_| ())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Pipe>, IpcError> {
        let mut pipes = self.pipes.lock().unwrap();
        if let Some(pipe) = pipes.get(id) {
            return Ok(pipe.clone());
        }
        let pipe = Arc::new(Pipe::open(&self.dir, id)?);
        pipes.insert(id.to_string(), pipe.clone());
        Ok(pipe)
    }

    pub fn write(&self, id: &str, data: &[u8], nonblocking: bool) -> Result<usize, IpcError> {
        self.get(id)?.write(data, nonblocking)
    }

    pub fn read(&self, id: &str, size: usize, nonblocking: bool) -> Result<Vec<u8>, IpcError> {
        self.get(id)?.read(size, nonblocking)
    }

    /// Close a pipe and, once no attachment remains anywhere, remove its
    /// on-disk artefacts.
    pub fn close(&self, id: &str) -> Result<(), IpcError> {
        let pipe = {
            let mut pipes = self.pipes.lock().unwrap();
            pipes
                .remove(id)
                .ok_or_else(|| IpcError::NotFound(format!("pipe {id}")))?
        };
        pipe.close()?;
        if pipe.unused() {
            pipe.remove_files();
        }
        Ok(())
    }

    /// Close everything this registry still holds. Used on shutdown.
    pub fn close_all(&self) {
        let pipes: Vec<Arc<Pipe>> = self.pipes.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pipe in pipes {
            if pipe.close().is_ok() && pipe.unused() {
                pipe.remove_files();
            }
        }
    }
}
