//! Counting semaphore with an on-disk `KSEM` record.
//!
//! The record is small enough to rewrite wholesale after every mutation:
//! magic, version, value, max_value, waiter count and the time of the last
//! operation as an f64. `release` saturates at `max_value`; excess releases
//! are silently absorbed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use super::{now_epoch, IpcError, LockFile};
use crate::persist;

pub const MAGIC: &[u8; 4] = b"KSEM";
pub const VERSION: u32 = 1;
pub const RECORD_SIZE: usize = 28;

const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct SemaphoreMeta {
    sem_id: String,
    name: String,
    value: u32,
    max_value: u32,
    waiters: u32,
    created: String,
    creator_pid: u32,
}

struct SemInner {
    value: u32,
    waiters: u32,
    closed: bool,
}

pub struct Semaphore {
    pub id: String,
    pub name: String,
    pub max_value: u32,
    sem_path: PathBuf,
    meta_path: PathBuf,
    lock_path: PathBuf,
    lock_file: LockFile,
    inner: Mutex<SemInner>,
    available: Condvar,
}

impl Semaphore {
    pub fn create(
        dir: &Path,
        name: Option<String>,
        value: u32,
        max_value: u32,
    ) -> Result<Self, IpcError> {
        if max_value == 0 {
            return Err(IpcError::InvalidArgument(
                "semaphore max_value must be greater than zero".into(),
            ));
        }
        if value > max_value {
            return Err(IpcError::InvalidArgument(format!(
                "semaphore value {value} exceeds max_value {max_value}"
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("sem_{id}"));
        let sem_path = dir.join(format!("{id}.sem"));
        let meta_path = dir.join(format!("{id}.meta"));
        let lock_path = dir.join(format!("{id}.lock"));

        let meta = SemaphoreMeta {
            sem_id: id.clone(),
            name: name.clone(),
            value,
            max_value,
            waiters: 0,
            created: chrono::Utc::now().to_rfc3339(),
            creator_pid: std::process::id(),
        };
        persist::write_json_atomic(&meta_path, &meta)?;
        let lock_file = LockFile::ensure(lock_path.clone())?;
        write_record(&sem_path, value, max_value, 0)?;

        debug!("Created semaphore {id} ({name}), value {value}/{max_value}");
        Ok(Self {
            id,
            name,
            max_value,
            sem_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(SemInner {
                value,
                waiters: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn open(dir: &Path, id: &str) -> Result<Self, IpcError> {
        let meta_path = dir.join(format!("{id}.meta"));
        let meta: SemaphoreMeta = persist::read_json(&meta_path)
            .map_err(|_| IpcError::NotFound(format!("semaphore {id}")))?;
        let sem_path = dir.join(format!("{id}.sem"));
        let lock_path = dir.join(format!("{id}.lock"));
        let lock_file = LockFile::ensure(lock_path.clone())?;
        let (value, max_value) = read_record(&sem_path, id)?;

        debug!("Opened semaphore {id} ({})", meta.name);
        Ok(Self {
            id: id.to_string(),
            name: meta.name,
            max_value,
            sem_path,
            meta_path,
            lock_path,
            lock_file,
            inner: Mutex::new(SemInner {
                value,
                waiters: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    fn persist(&self, inner: &SemInner) -> Result<(), IpcError> {
        let _guard = self.lock_file.lock()?;
        write_record(&self.sem_path, inner.value, self.max_value, inner.waiters)?;
        let meta = SemaphoreMeta {
            sem_id: self.id.clone(),
            name: self.name.clone(),
            value: inner.value,
            max_value: self.max_value,
            waiters: inner.waiters,
            created: chrono::Utc::now().to_rfc3339(),
            creator_pid: std::process::id(),
        };
        persist::write_json_atomic(&self.meta_path, &meta)?;
        Ok(())
    }

    /// Acquire one unit. The fast path decrements without sleeping; the
    /// slow path registers a waiter and sleeps on the condition within the
    /// caller's timeout budget. Nonblocking failure is `WouldBlock`, an
    /// exhausted budget is `Timeout`.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<(), IpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(IpcError::Closed(format!("semaphore {}", self.id)));
        }
        if inner.value > 0 {
            inner.value -= 1;
            self.persist(&inner)?;
            trace!("semaphore {}: acquired (fast), value {}", self.id, inner.value);
            return Ok(());
        }
        if !blocking {
            return Err(IpcError::WouldBlock);
        }

        inner.waiters += 1;
        self.persist(&inner)?;
        let started = Instant::now();
        loop {
            let slice = match timeout {
                Some(budget) => {
                    let elapsed = started.elapsed();
                    if elapsed >= budget {
                        inner.waiters = inner.waiters.saturating_sub(1);
                        self.persist(&inner)?;
                        return Err(IpcError::Timeout);
                    }
                    (budget - elapsed).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            let (guard, _) = self.available.wait_timeout(inner, slice).unwrap();
            inner = guard;
            if inner.closed {
                inner.waiters = inner.waiters.saturating_sub(1);
                return Err(IpcError::Closed(format!("semaphore {}", self.id)));
            }
            if inner.value > 0 {
                inner.value -= 1;
                inner.waiters = inner.waiters.saturating_sub(1);
                self.persist(&inner)?;
                trace!("semaphore {}: acquired (slow), value {}", self.id, inner.value);
                return Ok(());
            }
        }
    }

    /// Release `count` units, saturating at `max_value`.
    pub fn release(&self, count: u32) -> Result<(), IpcError> {
        if count == 0 {
            return Err(IpcError::InvalidArgument(
                "release count must be greater than zero".into(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(IpcError::Closed(format!("semaphore {}", self.id)));
        }
        inner.value = inner.value.saturating_add(count).min(self.max_value);
        self.persist(&inner)?;
        self.available.notify_all();
        trace!("semaphore {}: released {count}, value {}", self.id, inner.value);
        Ok(())
    }

    pub fn value(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            0
        } else {
            inner.value
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.available.notify_all();
        debug!("Closed semaphore {} ({})", self.id, self.name);
    }

    fn remove_files(&self) {
        for path in &[&self.sem_path, &self.meta_path, &self.lock_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn write_record(path: &Path, value: u32, max_value: u32, waiters: u32) -> Result<(), IpcError> {
    let mut record = Vec::with_capacity(RECORD_SIZE);
    record.extend_from_slice(MAGIC);
    record.extend_from_slice(&VERSION.to_le_bytes());
    record.extend_from_slice(&value.to_le_bytes());
    record.extend_from_slice(&max_value.to_le_bytes());
    record.extend_from_slice(&waiters.to_le_bytes());
    record.extend_from_slice(&now_epoch().to_le_bytes());
    let mut file = std::fs::File::create(path)?;
    file.write_all(&record)?;
    Ok(())
}

fn read_record(path: &Path, id: &str) -> Result<(u32, u32), IpcError> {
    let mut raw = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < RECORD_SIZE || &raw[0..4] != MAGIC {
        return Err(IpcError::Corrupt(format!("semaphore {id}: bad record")));
    }
    let field = |offset: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&raw[offset..offset + 4]);
        u32::from_le_bytes(buf)
    };
    if field(4) != VERSION {
        return Err(IpcError::Corrupt(format!(
            "semaphore {id}: unsupported version"
        )));
    }
    Ok((field(8), field(12)))
}

pub struct SemaphoreRegistry {
    dir: PathBuf,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SemaphoreRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        name: Option<String>,
        value: u32,
        max_value: u32,
    ) -> Result<String, IpcError> {
        let semaphore = Semaphore::create(&self.dir, name, value, max_value)?;
        let id = semaphore.id.clone();
        self.semaphores
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(semaphore));
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Semaphore>, IpcError> {
        let mut semaphores = self.semaphores.lock().unwrap();
        if let Some(semaphore) = semaphores.get(id) {
            return Ok(semaphore.clone());
        }
        let semaphore = Arc::new(Semaphore::open(&self.dir, id)?);
        semaphores.insert(id.to_string(), semaphore.clone());
        Ok(semaphore)
    }

    pub fn delete(&self, id: &str) -> Result<(), IpcError> {
        let semaphore = self.get(id)?;
        self.semaphores.lock().unwrap().remove(id);
        semaphore.close();
        semaphore.remove_files();
        debug!("Deleted semaphore {id}");
        Ok(())
    }

    pub fn close_all(&self) {
        for (_, semaphore) in self.semaphores.lock().unwrap().drain() {
            semaphore.close();
        }
    }
}
