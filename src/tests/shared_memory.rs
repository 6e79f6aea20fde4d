use std::sync::Arc;

use crate::ipc::{IpcError, SharedMemory, SharedMemoryRegistry};

fn registry() -> (tempfile::TempDir, SharedMemoryRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = SharedMemoryRegistry::new(dir.path().to_path_buf());
    (dir, registry)
}

#[test]
fn test_write_read_roundtrip_at_offset() {
    let (_dir, registry) = registry();
    let id = registry.create(Some("region".into()), 128, 0o644).unwrap();
    let segment = registry.get(&id).unwrap();

    assert_eq!(segment.write(b"payload", 16).unwrap(), 7);
    assert_eq!(segment.read(16, 7).unwrap(), b"payload".to_vec());
    // untouched bytes stay zeroed
    assert_eq!(segment.read(0, 4).unwrap(), vec![0, 0, 0, 0]);
}

#[test]
fn test_bounds_are_checked() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 32, 0o644).unwrap();
    let segment = registry.get(&id).unwrap();

    match segment.read(-1, 4) {
        Err(IpcError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument for negative offset, got {other:?}"),
    }
    match segment.write(b"toolong", 30) {
        Err(IpcError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument for overflow, got {other:?}"),
    }
    match segment.read(0, 33) {
        Err(IpcError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument for oversized read, got {other:?}"),
    }
}

#[test]
fn test_user_count_tracks_attach_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SharedMemoryRegistry::new(dir.path().to_path_buf());
    let id = registry.create(None, 64, 0o644).unwrap();
    assert_eq!(registry.get(&id).unwrap().user_count(), 1);

    let second = SharedMemory::attach(dir.path(), &id).unwrap();
    assert_eq!(second.user_count(), 2);
    assert_eq!(second.detach().unwrap(), 1);
}

#[test]
fn test_last_detach_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SharedMemoryRegistry::new(dir.path().to_path_buf());
    let id = registry.create(None, 64, 0o644).unwrap();
    registry.detach(&id).unwrap();
    assert!(!dir.path().join(format!("{id}.shm")).exists());
    assert!(!dir.path().join(format!("{id}.meta")).exists());
}

#[test]
fn test_exclusive_lock_excludes_other_holders() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SharedMemoryRegistry::new(dir.path().to_path_buf());
    let id = registry.create(None, 64, 0o644).unwrap();
    let holder = registry.get(&id).unwrap();
    let contender = Arc::new(SharedMemory::attach(dir.path(), &id).unwrap());

    holder.lock(true).unwrap();
    match contender.lock(false) {
        Err(IpcError::WouldBlock) => {}
        other => panic!("expected WouldBlock, got {other:?}"),
    }
    holder.unlock().unwrap();
    contender.lock(false).unwrap();
    contender.unlock().unwrap();
}

/// A reader holding the exclusive lock observes either the pre-state or
/// the post-state of a write, never a mixture.
#[test]
fn test_locked_reader_sees_consistent_state() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SharedMemoryRegistry::new(dir.path().to_path_buf());
    let id = registry.create(None, 64, 0o644).unwrap();
    let writer = registry.get(&id).unwrap();
    let reader = Arc::new(SharedMemory::attach(dir.path(), &id).unwrap());

    writer.write(&[0xAAu8; 64], 0).unwrap();
    writer.lock(true).unwrap();

    let reader_thread = {
        let reader = reader.clone();
        std::thread::spawn(move || {
            reader.lock(true).unwrap();
            let snapshot = reader.read(0, 64).unwrap();
            reader.unlock().unwrap();
            snapshot
        })
    };

    // overwrite the whole region while the reader is stuck on the lock
    std::thread::sleep(std::time::Duration::from_millis(100));
    writer.write(&[0xBBu8; 64], 0).unwrap();
    writer.unlock().unwrap();

    let snapshot = reader_thread.join().unwrap();
    assert_eq!(snapshot, vec![0xBB; 64]);
}
