use std::sync::Arc;

use crate::ipc::{IpcError, Pipe, PipeRegistry};

fn registry() -> (tempfile::TempDir, PipeRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = PipeRegistry::new(dir.path().to_path_buf());
    (dir, registry)
}

#[test]
fn test_pipe_is_fifo_and_byte_preserving() {
    let (_dir, registry) = registry();
    let id = registry.create(Some("fifo".into()), 64).unwrap();

    let chunks: [&[u8]; 3] = [b"first ", b"second ", b"third"];
    for chunk in &chunks {
        assert_eq!(registry.write(&id, chunk, false).unwrap(), chunk.len());
    }
    let mut collected = Vec::new();
    loop {
        let data = registry.read(&id, 7, true).unwrap();
        if data.is_empty() {
            break;
        }
        collected.extend(data);
    }
    assert_eq!(collected, b"first second third".to_vec());
}

#[test]
fn test_zero_length_operations() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 16).unwrap();
    assert_eq!(registry.write(&id, b"", false).unwrap(), 0);
    assert_eq!(registry.read(&id, 0, false).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_nonblocking_read_on_empty_pipe() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 16).unwrap();
    assert_eq!(registry.read(&id, 8, true).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_nonblocking_write_on_full_pipe() {
    let (_dir, registry) = registry();
    // capacity is buffer_size - 1: one slot stays free
    let id = registry.create(None, 8).unwrap();
    assert_eq!(registry.write(&id, b"1234567890", true).unwrap(), 7);
    assert_eq!(registry.write(&id, b"x", true).unwrap(), 0);
}

#[test]
fn test_buffer_size_zero_is_rejected() {
    let (_dir, registry) = registry();
    match registry.create(None, 0) {
        Err(IpcError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn test_closed_pipe_drains_then_returns_empty() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 32).unwrap();
    let pipe = registry.get(&id).unwrap();
    pipe.write(b"leftover", false).unwrap();
    pipe.close().unwrap();
    assert_eq!(pipe.read(16, false).unwrap(), b"leftover".to_vec());
    assert_eq!(pipe.read(16, false).unwrap(), Vec::<u8>::new());
    assert_eq!(pipe.write(b"more", false).unwrap(), 0);
}

#[test]
fn test_reopen_by_second_handle_sees_data() {
    let dir = tempfile::tempdir().unwrap();
    let registry = PipeRegistry::new(dir.path().to_path_buf());
    let id = registry.create(Some("shared".into()), 64).unwrap();
    registry.write(&id, b"over the wall", false).unwrap();

    // a second attach path reconstructs the view from disk
    let other = Pipe::open(dir.path(), &id).unwrap();
    assert_eq!(other.read(32, true).unwrap(), b"over the wall".to_vec());
    assert_eq!(other.buffer_size, 64);
    assert_eq!(other.name, "shared");
}

#[test]
fn test_error_state_rejects_io_but_allows_close() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 32).unwrap();
    let pipe = registry.get(&id).unwrap();
    pipe.set_error(5);
    match pipe.write(b"data", false) {
        Err(IpcError::Closed(_)) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    match pipe.read(4, false) {
        Err(IpcError::Closed(_)) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    pipe.close().unwrap();
}

/// The pipe echo scenario: a 16 byte pipe, a writer that outgrows the ring
/// and blocks, a reader that unblocks it. Totals must match.
#[test]
fn test_pipe_echo_with_blocking_writer() {
    let (_dir, registry) = registry();
    let id = registry.create(Some("echo".into()), 16).unwrap();
    let pipe = registry.get(&id).unwrap();

    assert_eq!(pipe.write(b"hello", false).unwrap(), 5);
    assert_eq!(pipe.read(16, false).unwrap(), b"hello".to_vec());

    assert_eq!(pipe.write(b"world!", false).unwrap(), 6);

    let writer_pipe: Arc<Pipe> = pipe.clone();
    let writer = std::thread::spawn(move || {
        let payload = b"XXXXXXXXXXXX";
        let mut written = 0;
        while written < payload.len() {
            written += writer_pipe.write(&payload[written..], false).unwrap();
        }
        written
    });

    // give the writer time to fill the ring and block on the full pipe
    std::thread::sleep(std::time::Duration::from_millis(200));

    let mut collected = Vec::new();
    collected.extend(pipe.read(5, false).unwrap());
    assert_eq!(writer.join().unwrap(), 12);
    while collected.len() < 18 {
        let data = pipe.read(18, false).unwrap();
        assert!(!data.is_empty(), "pipe drained before all bytes arrived");
        collected.extend(data);
    }
    assert_eq!(collected, b"world!XXXXXXXXXXXX".to_vec());
}
