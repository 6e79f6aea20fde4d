use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ipc::signals::{signum, SignalError, SignalTable};
use crate::process::{ProcessPriority, ProcessTable, SpawnRequest};

fn spawn_sleeper(table: &ProcessTable) -> u32 {
    table
        .spawn(SpawnRequest {
            name: "sleeper".into(),
            command: "sleep 30".into(),
            args: Vec::new(),
            environment: std::env::vars().collect(),
            working_directory: None,
            user: None,
            priority: ProcessPriority::Normal,
            parent_pid: None,
        })
        .unwrap()
}

fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    for _ in 0..50 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!(
        "handler ran {} times, expected {expected}",
        counter.load(Ordering::SeqCst)
    );
}

#[test]
fn test_handler_runs_on_delivery() {
    let processes = ProcessTable::new();
    let signals = SignalTable::new();
    let pid = spawn_sleeper(&processes);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    signals.register_handler(
        pid,
        signum::SIGUSER,
        Some(Arc::new(move |_signal, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    signals.send(&processes, pid, signum::SIGUSER, None).unwrap();
    wait_for_count(&fired, 1);

    processes.terminate(pid, true).unwrap();
    processes.wait(pid, Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_blocked_signal_goes_pending_and_unblock_drains() {
    let processes = ProcessTable::new();
    let signals = SignalTable::new();
    let pid = spawn_sleeper(&processes);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    signals.register_handler(
        pid,
        signum::SIGIPC,
        Some(Arc::new(move |_signal, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    assert!(signals.block(pid, signum::SIGIPC));
    signals.send(&processes, pid, signum::SIGIPC, None).unwrap();
    signals.send(&processes, pid, signum::SIGIPC, None).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // unblocking invokes the handler once per pending unit
    signals.unblock(pid, signum::SIGIPC);
    wait_for_count(&fired, 2);

    processes.terminate(pid, true).unwrap();
    processes.wait(pid, Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_termination_signals_cannot_be_blocked() {
    let signals = SignalTable::new();
    assert!(!signals.block(4242, signum::SIGKILL));
    assert!(!signals.block(4242, signum::SIGTERM));
    assert!(signals.block(4242, signum::SIGHUP));
}

#[test]
fn test_sigterm_is_forwarded_to_the_host_process() {
    let processes = ProcessTable::new();
    let signals = SignalTable::new();
    let pid = spawn_sleeper(&processes);

    signals.send(&processes, pid, signum::SIGTERM, None).unwrap();
    let exit_code = processes.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(exit_code, -15);
}

#[test]
fn test_send_to_unknown_process_fails() {
    let processes = ProcessTable::new();
    let signals = SignalTable::new();
    match signals.send(&processes, 99999, signum::SIGUSER, None) {
        Err(SignalError::NoSuchProcess(99999)) => {}
        other => panic!("expected NoSuchProcess, got {other:?}"),
    }
}

#[test]
fn test_process_pending_drains_one_unit_per_signal() {
    let processes = ProcessTable::new();
    let signals = SignalTable::new();
    let pid = spawn_sleeper(&processes);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    signals.register_handler(
        pid,
        signum::SIGTASK,
        Some(Arc::new(move |_signal, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    signals.block(pid, signum::SIGTASK);
    signals.send(&processes, pid, signum::SIGTASK, None).unwrap();
    signals.send(&processes, pid, signum::SIGTASK, None).unwrap();

    // still blocked: pending units stay put
    assert_eq!(signals.process_pending(pid), 0);

    signals.unblock(pid, signum::SIGTASK);
    wait_for_count(&fired, 2);
    assert_eq!(signals.process_pending(pid), 0);

    processes.terminate(pid, true).unwrap();
    processes.wait(pid, Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_cleanup_drops_the_entry() {
    let signals = SignalTable::new();
    signals.register_handler(777, signum::SIGUSER, Some(Arc::new(|_, _| {})));
    signals.cleanup(777);
    // without an entry, pending processing is a no-op
    assert_eq!(signals.process_pending(777), 0);
}
