//! Priority message queue where the directory listing is the queue.
//!
//! Every message lives in its own file named `PRI_TYPE_SEQ.msg`; receive
//! scans the directory, picks the highest priority (ties broken by lowest
//! sequence number) and unlinks the file. Payloads are framed with
//! MessagePack so dynamic, dict-shaped data survives the trip between
//! unrelated processes; they surface as `rmpv::Value`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::{now_epoch, IpcError, LockFile};
use crate::persist;

const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct QueueMeta {
    queue_id: String,
    name: String,
    max_messages: u32,
    max_size: u32,
    created: String,
    creator_pid: u32,
    next_msg_id: u64,
}

/// One received message, exactly as framed on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: u8,
    pub priority: u8,
    pub timestamp: f64,
    pub sender_pid: u32,
    pub data: rmpv::Value,
}

struct QueueInner {
    next_msg_id: u64,
    closed: bool,
}

pub struct MessageQueue {
    pub id: String,
    pub name: String,
    pub max_messages: u32,
    pub max_size: u32,
    queue_dir: PathBuf,
    msg_dir: PathBuf,
    meta_path: PathBuf,
    lock_file: LockFile,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Parsed view of a `PRI_TYPE_SEQ.msg` filename.
struct MessageFile {
    priority: u8,
    msg_type: u8,
    seq: u64,
    path: PathBuf,
}

fn parse_message_filename(path: PathBuf) -> Option<MessageFile> {
    let stem = path.file_name()?.to_str()?.strip_suffix(".msg")?.to_string();
    let mut parts = stem.splitn(3, '_');
    let priority = parts.next()?.parse().ok()?;
    let msg_type = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    Some(MessageFile {
        priority,
        msg_type,
        seq,
        path,
    })
}

impl MessageQueue {
    pub fn create(
        base_dir: &Path,
        name: Option<String>,
        max_messages: u32,
        max_size: u32,
    ) -> Result<Self, IpcError> {
        if max_messages == 0 {
            return Err(IpcError::InvalidArgument(
                "max_messages must be greater than zero".into(),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("msgq_{id}"));
        let queue_dir = base_dir.join(&id);
        let msg_dir = queue_dir.join("messages");
        std::fs::create_dir_all(&msg_dir)?;

        let meta_path = queue_dir.join("metadata.json");
        let meta = QueueMeta {
            queue_id: id.clone(),
            name: name.clone(),
            max_messages,
            max_size,
            created: chrono::Utc::now().to_rfc3339(),
            creator_pid: std::process::id(),
            next_msg_id: 1,
        };
        persist::write_json_atomic(&meta_path, &meta)?;
        let lock_file = LockFile::ensure(queue_dir.join("lock"))?;

        debug!("Created message queue {id} ({name})");
        Ok(Self {
            id,
            name,
            max_messages,
            max_size,
            queue_dir,
            msg_dir,
            meta_path,
            lock_file,
            inner: Mutex::new(QueueInner {
                next_msg_id: 1,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    pub fn open(base_dir: &Path, id: &str) -> Result<Self, IpcError> {
        let queue_dir = base_dir.join(id);
        let meta_path = queue_dir.join("metadata.json");
        let meta: QueueMeta = persist::read_json(&meta_path)
            .map_err(|_| IpcError::NotFound(format!("message queue {id}")))?;
        let msg_dir = queue_dir.join("messages");
        std::fs::create_dir_all(&msg_dir)?;
        let lock_file = LockFile::ensure(queue_dir.join("lock"))?;

        debug!("Opened message queue {id} ({})", meta.name);
        Ok(Self {
            id: id.to_string(),
            name: meta.name,
            max_messages: meta.max_messages,
            max_size: meta.max_size,
            queue_dir,
            msg_dir,
            meta_path,
            lock_file,
            inner: Mutex::new(QueueInner {
                next_msg_id: meta.next_msg_id,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    fn message_count(&self) -> usize {
        match std::fs::read_dir(&self.msg_dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).count(),
            Err(err) => {
                warn!("message queue {}: failed to list messages: {err}", self.id);
                0
            }
        }
    }

    /// All message files matching `msg_type` (0 accepts any), ordered by
    /// decreasing priority then increasing sequence.
    fn matching_messages(&self, msg_type: u8) -> Vec<MessageFile> {
        let mut files: Vec<MessageFile> = match std::fs::read_dir(&self.msg_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| parse_message_filename(e.path()))
                .filter(|m| msg_type == 0 || m.msg_type == msg_type)
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort_by_key(|m| (std::cmp::Reverse(m.priority), m.seq));
        files
    }

    fn persist_meta(&self, next_msg_id: u64) -> Result<(), IpcError> {
        let meta = QueueMeta {
            queue_id: self.id.clone(),
            name: self.name.clone(),
            max_messages: self.max_messages,
            max_size: self.max_size,
            created: chrono::Utc::now().to_rfc3339(),
            creator_pid: std::process::id(),
            next_msg_id,
        };
        persist::write_json_atomic(&self.meta_path, &meta)?;
        Ok(())
    }

    /// Enqueue a payload. `msg_type` and `priority` are clamped to
    /// `[0, 255]`. The advisory lock is released while waiting for space so
    /// other processes can drain the queue in the meantime.
    pub fn send(
        &self,
        data: rmpv::Value,
        msg_type: i64,
        priority: i64,
        blocking: bool,
    ) -> Result<(), IpcError> {
        let msg_type = msg_type.clamp(0, 255) as u8;
        let priority = priority.clamp(0, 255) as u8;

        let message = Message {
            msg_type,
            priority,
            timestamp: now_epoch(),
            sender_pid: std::process::id(),
            data,
        };
        let encoded = rmp_serde::to_vec(&message)
            .map_err(|e| IpcError::InvalidArgument(format!("unserializable message: {e}")))?;
        if encoded.len() > self.max_size as usize {
            return Err(IpcError::LimitExceeded(format!(
                "message of {} bytes exceeds max_size {}",
                encoded.len(),
                self.max_size
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(IpcError::Closed(format!("message queue {}", self.id)));
            }
            {
                let _guard = self.lock_file.lock()?;
                if self.message_count() < self.max_messages as usize {
                    let seq = inner.next_msg_id;
                    inner.next_msg_id += 1;
                    self.persist_meta(inner.next_msg_id)?;

                    let filename = format!("{priority:03}_{msg_type:03}_{seq:010}.msg");
                    let final_path = self.msg_dir.join(&filename);
                    let tmp_path = self.queue_dir.join(format!("{filename}.tmp"));
                    std::fs::write(&tmp_path, &encoded)?;
                    std::fs::rename(&tmp_path, &final_path)?;

                    drop(_guard);
                    self.not_empty.notify_all();
                    trace!("queue {}: sent message seq {seq} pri {priority}", self.id);
                    return Ok(());
                }
            }
            if !blocking {
                return Err(IpcError::WouldBlock);
            }
            let (guard, _) = self.not_full.wait_timeout(inner, WAIT_SLICE).unwrap();
            inner = guard;
        }
    }

    /// Dequeue the highest-priority message, FIFO within a priority.
    /// A `msg_type` filter of 0 accepts any type.
    pub fn receive(&self, msg_type: i64, blocking: bool) -> Result<Message, IpcError> {
        let msg_type = msg_type.clamp(0, 255) as u8;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(IpcError::Closed(format!("message queue {}", self.id)));
            }
            {
                let _guard = self.lock_file.lock()?;
                if let Some(head) = self.matching_messages(msg_type).into_iter().next() {
                    let bytes = std::fs::read(&head.path)?;
                    let message: Message = rmp_serde::from_slice(&bytes).map_err(|e| {
                        IpcError::Corrupt(format!("queue {}: bad message frame: {e}", self.id))
                    })?;
                    std::fs::remove_file(&head.path)?;
                    drop(_guard);
                    self.not_full.notify_all();
                    trace!("queue {}: received message seq {}", self.id, head.seq);
                    return Ok(message);
                }
            }
            if !blocking {
                return Err(IpcError::WouldBlock);
            }
            let (guard, _) = self.not_empty.wait_timeout(inner, WAIT_SLICE).unwrap();
            inner = guard;
        }
    }

    /// Mark the in-memory handle closed and wake all waiters.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        debug!("Closed message queue {} ({})", self.id, self.name);
    }

    fn remove_tree(&self) {
        let _ = std::fs::remove_dir_all(&self.queue_dir);
    }
}

pub struct MessageQueueRegistry {
    dir: PathBuf,
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
}

impl MessageQueueRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        name: Option<String>,
        max_messages: u32,
        max_size: u32,
    ) -> Result<String, IpcError> {
        let queue = MessageQueue::create(&self.dir, name, max_messages, max_size)?;
        let id = queue.id.clone();
        self.queues
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(queue));
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<MessageQueue>, IpcError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get(id) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(MessageQueue::open(&self.dir, id)?);
        queues.insert(id.to_string(), queue.clone());
        Ok(queue)
    }

    pub fn send(
        &self,
        id: &str,
        data: rmpv::Value,
        msg_type: i64,
        priority: i64,
        blocking: bool,
    ) -> Result<(), IpcError> {
        self.get(id)?.send(data, msg_type, priority, blocking)
    }

    pub fn receive(&self, id: &str, msg_type: i64, blocking: bool) -> Result<Message, IpcError> {
        self.get(id)?.receive(msg_type, blocking)
    }

    /// Close all in-memory handles and remove the queue's directory tree.
    pub fn delete(&self, id: &str) -> Result<(), IpcError> {
        let queue = self.get(id)?;
        self.queues.lock().unwrap().remove(id);
        queue.close();
        queue.remove_tree();
        debug!("Deleted message queue {id}");
        Ok(())
    }

    pub fn close_all(&self) {
        for (_, queue) in self.queues.lock().unwrap().drain() {
            queue.close();
        }
    }
}
