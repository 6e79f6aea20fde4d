//! Shared memory region over a memory-mapped file.
//!
//! The 128 byte `KSHM` header carries a user count maintained on
//! attach/detach, an `in_use` bit that is set for the duration of each
//! write window and a `locked` bit for the explicit exclusive lock.
//! Readers without the exclusive lock may observe torn data while `in_use`
//! is set; that is part of the contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use super::{read_u32, write_u32, IpcError, LockFile};
use crate::persist;

pub const HEADER_SIZE: usize = 128;
pub const MAGIC: &[u8; 4] = b"KSHM";
pub const VERSION: u32 = 1;

const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_SIZE: usize = 12;
const OFF_USER_COUNT: usize = 16;
const OFF_CREATOR_PID: usize = 20;
const OFF_ATIME_S: usize = 24;
const OFF_ATIME_US: usize = 28;
const OFF_PERMISSIONS: usize = 32;

const FLAG_IN_USE: u32 = 1;
const FLAG_LOCKED: u32 = 2;

const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct ShmMeta {
    shm_id: String,
    name: String,
    size: u32,
    permissions: u32,
    created: String,
    creator_pid: u32,
}

struct ShmInner {
    map: MmapMut,
    closed: bool,
    /// Whether this handle currently holds the exclusive lock.
    holds_lock: bool,
}

pub struct SharedMemory {
    pub id: String,
    pub name: String,
    pub size: u32,
    pub permissions: u32,
    data_path: PathBuf,
    meta_path: PathBuf,
    lock_path: PathBuf,
    lock_file: LockFile,
    inner: Mutex<ShmInner>,
    unlocked: Condvar,
}

impl SharedMemory {
    pub fn create(
        dir: &Path,
        name: Option<String>,
        size: u32,
        permissions: u32,
    ) -> Result<Self, IpcError> {
        if size == 0 {
            return Err(IpcError::InvalidArgument(
                "shared memory size must be greater than zero".into(),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("shm_{id}"));
        let data_path = dir.join(format!("{id}.shm"));
        let meta_path = dir.join(format!("{id}.meta"));
        let lock_path = dir.join(format!("{id}.lock"));

        let meta = ShmMeta {
            shm_id: id.clone(),
            name: name.clone(),
            size,
            permissions,
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
        file.set_len((HEADER_SIZE + size as usize) as u64)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(permissions));
        }
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(IpcError::Io)?;

        map[0..4].copy_from_slice(MAGIC);
        write_u32(&mut map, OFF_VERSION, VERSION);
        write_u32(&mut map, OFF_FLAGS, 0);
        write_u32(&mut map, OFF_SIZE, size);
        write_u32(&mut map, OFF_USER_COUNT, 1);
        write_u32(&mut map, OFF_CREATOR_PID, std::process::id());
        Self::stamp_atime(&mut map);
        write_u32(&mut map, OFF_PERMISSIONS, permissions);

        debug!("Created shared memory {id} ({name}), {size} bytes");
        Ok(Self {
            id,
            name,
            size,
            permissions,
            data_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(ShmInner {
                map,
                closed: false,
                holds_lock: false,
            }),
            unlocked: Condvar::new(),
        })
    }

    /// Attach to an existing segment, bumping the user count.
    pub fn attach(dir: &Path, id: &str) -> Result<Self, IpcError> {
        let meta_path = dir.join(format!("{id}.meta"));
        let meta: ShmMeta = persist::read_json(&meta_path)
            .map_err(|_| IpcError::NotFound(format!("shared memory {id}")))?;
        let data_path = dir.join(format!("{id}.shm"));
        let lock_path = dir.join(format!("{id}.lock"));
        let lock_file = LockFile::ensure(lock_path.clone())?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(IpcError::Io)?;
        if &map[0..4] != MAGIC {
            return Err(IpcError::Corrupt(format!("shared memory {id}: bad magic")));
        }
        if read_u32(&map, OFF_VERSION) != VERSION {
            return Err(IpcError::Corrupt(format!(
                "shared memory {id}: unsupported version"
            )));
        }

        {
            let _guard = lock_file.lock()?;
            let users = read_u32(&map, OFF_USER_COUNT);
            write_u32(&mut map, OFF_USER_COUNT, users + 1);
        }

        debug!("Attached shared memory {id} ({})", meta.name);
        Ok(Self {
            id: id.to_string(),
            name: meta.name,
            size: meta.size,
            permissions: meta.permissions,
            data_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(ShmInner {
                map,
                closed: false,
                holds_lock: false,
            }),
            unlocked: Condvar::new(),
        })
    }

    fn stamp_atime(map: &mut MmapMut) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        write_u32(map, OFF_ATIME_S, now.as_secs() as u32);
        write_u32(map, OFF_ATIME_US, now.subsec_micros());
    }

    fn check_bounds(&self, offset: i64, size: usize) -> Result<usize, IpcError> {
        if offset < 0 {
            return Err(IpcError::InvalidArgument(
                "negative offset into shared memory".into(),
            ));
        }
        let offset = offset as usize;
        if offset + size > self.size as usize {
            return Err(IpcError::InvalidArgument(format!(
                "range {}..{} out of bounds for segment of {} bytes",
                offset,
                offset + size,
                self.size
            )));
        }
        Ok(offset)
    }

    pub fn read(&self, offset: i64, size: usize) -> Result<Vec<u8>, IpcError> {
        let offset = self.check_bounds(offset, size)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(IpcError::Closed(format!("shared memory {}", self.id)));
        }
        let _guard = self.lock_file.lock()?;
        let out = inner.map[HEADER_SIZE + offset..HEADER_SIZE + offset + size].to_vec();
        Self::stamp_atime(&mut inner.map);
        Ok(out)
    }

    /// Copy `data` in at `offset`. The `in_use` flag is set for the
    /// duration of the copy so lock-free readers can detect the window.
    pub fn write(&self, data: &[u8], offset: i64) -> Result<usize, IpcError> {
        let offset = self.check_bounds(offset, data.len())?;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(IpcError::Closed(format!("shared memory {}", self.id)));
        }
        let _guard = self.lock_file.lock()?;
        let flags = read_u32(&inner.map, OFF_FLAGS);
        write_u32(&mut inner.map, OFF_FLAGS, flags | FLAG_IN_USE);
        inner.map[HEADER_SIZE + offset..HEADER_SIZE + offset + data.len()].copy_from_slice(data);
        let flags = read_u32(&inner.map, OFF_FLAGS);
        write_u32(&mut inner.map, OFF_FLAGS, flags & !FLAG_IN_USE);
        Self::stamp_atime(&mut inner.map);
        trace!("shm {}: wrote {} bytes at {offset}", self.id, data.len());
        Ok(data.len())
    }

    /// Take the explicit exclusive lock layered above the per-op advisory
    /// lock. Nonblocking failure surfaces as `WouldBlock`.
    pub fn lock(&self, blocking: bool) -> Result<(), IpcError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(IpcError::Closed(format!("shared memory {}", self.id)));
            }
            {
                let _guard = self.lock_file.lock()?;
                let flags = read_u32(&inner.map, OFF_FLAGS);
                if flags & FLAG_LOCKED == 0 {
                    write_u32(&mut inner.map, OFF_FLAGS, flags | FLAG_LOCKED);
                    inner.holds_lock = true;
                    trace!("shm {}: exclusive lock taken", self.id);
                    return Ok(());
                }
            }
            if !blocking {
                return Err(IpcError::WouldBlock);
            }
            let (guard, _) = self.unlocked.wait_timeout(inner, WAIT_SLICE).unwrap();
            inner = guard;
        }
    }

    pub fn unlock(&self) -> Result<(), IpcError> {
        let mut inner = self.inner.lock().unwrap();
        {
            let _guard = self.lock_file.lock()?;
            let flags = read_u32(&inner.map, OFF_FLAGS);
            write_u32(&mut inner.map, OFF_FLAGS, flags & !FLAG_LOCKED);
        }
        inner.holds_lock = false;
        self.unlocked.notify_all();
        trace!("shm {}: exclusive lock released", self.id);
        Ok(())
    }

    /// Drop this handle's user slot. Returns the remaining user count.
    pub fn detach(&self) -> Result<u32, IpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(self.user_count_of(&inner.map));
        }
        let remaining;
        {
            let _guard = self.lock_file.lock()?;
            if inner.holds_lock {
                let flags = read_u32(&inner.map, OFF_FLAGS);
                write_u32(&mut inner.map, OFF_FLAGS, flags & !FLAG_LOCKED);
                inner.holds_lock = false;
            }
            let users = read_u32(&inner.map, OFF_USER_COUNT).saturating_sub(1);
            write_u32(&mut inner.map, OFF_USER_COUNT, users);
            let _ = inner.map.flush();
            remaining = users;
        }
        inner.closed = true;
        self.unlocked.notify_all();
        debug!("Detached shared memory {} ({remaining} users left)", self.id);
        Ok(remaining)
    }

    fn user_count_of(&self, map: &MmapMut) -> u32 {
        read_u32(map, OFF_USER_COUNT)
    }

    pub fn user_count(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        self.user_count_of(&inner.map)
    }

    fn remove_files(&self) {
        for path in &[&self.data_path, &self.meta_path, &self.lock_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub struct SharedMemoryRegistry {
    dir: PathBuf,
    segments: Mutex<HashMap<String, Arc<SharedMemory>>>,
}

impl SharedMemoryRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            segments: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        name: Option<String>,
        size: u32,
        permissions: u32,
    ) -> Result<String, IpcError> {
        let segment = SharedMemory::create(&self.dir, name, size, permissions)?;
        let id = segment.id.clone();
        self.segments
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(segment));
        Ok(id)
    }

    pub fn attach(&self, id: &str) -> Result<(), IpcError> {
        self.get(id).map(|_| ())
    }

    pub fn get(&self, id: &str) -> Result<Arc<SharedMemory>, IpcError> {
        let mut segments = self.segments.lock().unwrap();
        if let Some(segment) = segments.get(id) {
            return Ok(segment.clone());
        }
        let segment = Arc::new(SharedMemory::attach(&self.dir, id)?);
        segments.insert(id.to_string(), segment.clone());
        Ok(segment)
    }

    /// Detach this process's handle; the last user's detach removes the
    /// on-disk files.
    pub fn detach(&self, id: &str) -> Result<(), IpcError> {
        let segment = {
            let mut segments = self.segments.lock().unwrap();
            segments
                .remove(id)
                .ok_or_else(|| IpcError::NotFound(format!("shared memory {id}")))?
        };
        if segment.detach()? == 0 {
            segment.remove_files();
        }
        Ok(())
    }

    /// Force removal regardless of remaining users: detach our handle and
    /// unlink the files.
    pub fn delete(&self, id: &str) -> Result<(), IpcError> {
        let segment = self.get(id)?;
        self.segments.lock().unwrap().remove(id);
        let _ = segment.detach();
        segment.remove_files();
        debug!("Deleted shared memory {id}");
        Ok(())
    }

    pub fn close_all(&self) {
        for (_, segment) in self.segments.lock().unwrap().drain() {
            if segment.detach().map(|u| u == 0).unwrap_or(false) {
                segment.remove_files();
            }
        }
    }
}
