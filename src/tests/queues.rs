use crate::ipc::{IpcError, MessageQueueRegistry};

fn registry() -> (tempfile::TempDir, MessageQueueRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = MessageQueueRegistry::new(dir.path().to_path_buf());
    (dir, registry)
}

fn text(payload: &str) -> rmpv::Value {
    rmpv::Value::from(payload)
}

#[test]
fn test_priority_order_with_fifo_ties() {
    let (_dir, registry) = registry();
    let id = registry.create(Some("prio".into()), 4, 4096).unwrap();

    registry.send(&id, text("a"), 0, 1, true).unwrap();
    registry.send(&id, text("b"), 0, 5, true).unwrap();
    registry.send(&id, text("c"), 0, 5, true).unwrap();
    registry.send(&id, text("d"), 0, 3, true).unwrap();

    let order: Vec<String> = (0..4)
        .map(|_| {
            registry
                .receive(&id, 0, false)
                .unwrap()
                .data
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(order, vec!["b", "c", "d", "a"]);
}

#[test]
fn test_receive_on_empty_queue_nonblocking() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 4, 4096).unwrap();
    match registry.receive(&id, 0, false) {
        Err(IpcError::WouldBlock) => {}
        other => panic!("expected WouldBlock, got {other:?}"),
    }
}

#[test]
fn test_send_on_full_queue_nonblocking() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 1, 4096).unwrap();
    registry.send(&id, text("only"), 0, 0, true).unwrap();
    match registry.send(&id, text("overflow"), 0, 0, false) {
        Err(IpcError::WouldBlock) => {}
        other => panic!("expected WouldBlock, got {other:?}"),
    }
}

#[test]
fn test_oversized_message_is_rejected() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 4, 64).unwrap();
    let big = "x".repeat(256);
    match registry.send(&id, text(&big), 0, 0, true) {
        Err(IpcError::LimitExceeded(_)) => {}
        other => panic!("expected LimitExceeded, got {other:?}"),
    }
}

#[test]
fn test_type_filter_skips_other_types() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 4, 4096).unwrap();
    registry.send(&id, text("one"), 1, 0, true).unwrap();
    registry.send(&id, text("two"), 2, 0, true).unwrap();

    let message = registry.receive(&id, 2, false).unwrap();
    assert_eq!(message.msg_type, 2);
    assert_eq!(message.data.as_str(), Some("two"));

    // filter 0 accepts anything, so the remaining message comes out
    let message = registry.receive(&id, 0, false).unwrap();
    assert_eq!(message.msg_type, 1);
}

#[test]
fn test_type_and_priority_are_clamped() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 4, 4096).unwrap();
    registry.send(&id, text("clamped"), 999, -17, true).unwrap();
    let message = registry.receive(&id, 0, false).unwrap();
    assert_eq!(message.msg_type, 255);
    assert_eq!(message.priority, 0);
}

#[test]
fn test_dict_payload_survives_framing() {
    let (_dir, registry) = registry();
    let id = registry.create(None, 4, 4096).unwrap();
    let payload = rmpv::Value::Map(vec![
        (rmpv::Value::from("kind"), rmpv::Value::from("alert")),
        (rmpv::Value::from("level"), rmpv::Value::from(3)),
    ]);
    registry.send(&id, payload.clone(), 0, 0, true).unwrap();
    let message = registry.receive(&id, 0, false).unwrap();
    assert_eq!(message.data, payload);
    assert_eq!(message.sender_pid, std::process::id());
}

#[test]
fn test_queue_survives_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let registry = MessageQueueRegistry::new(dir.path().to_path_buf());
    let id = registry.create(Some("durable".into()), 8, 4096).unwrap();
    registry.send(&id, text("persisted"), 0, 0, true).unwrap();

    // a fresh registry reconstructs the queue from the directory
    let other = MessageQueueRegistry::new(dir.path().to_path_buf());
    let message = other.receive(&id, 0, false).unwrap();
    assert_eq!(message.data.as_str(), Some("persisted"));
}

#[test]
fn test_delete_removes_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    let registry = MessageQueueRegistry::new(dir.path().to_path_buf());
    let id = registry.create(None, 4, 4096).unwrap();
    registry.send(&id, text("doomed"), 0, 0, true).unwrap();
    registry.delete(&id).unwrap();
    assert!(!dir.path().join(&id).exists());
    match registry.receive(&id, 0, false) {
        Err(IpcError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}
