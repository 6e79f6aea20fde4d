use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::process::{
    ProcessPriority, ProcessState, ProcessTable, SpawnError, SpawnRequest,
};

fn request(command: &str) -> SpawnRequest {
    SpawnRequest {
        name: "test".into(),
        command: command.into(),
        args: Vec::new(),
        environment: std::env::vars().collect(),
        working_directory: None,
        user: None,
        priority: ProcessPriority::Normal,
        parent_pid: None,
    }
}

#[test]
fn test_spawn_wait_and_capture_output() {
    let table = ProcessTable::new();
    let pid = table.spawn(request("echo captured output")).unwrap();
    assert!(pid >= crate::process::FIRST_PID);

    let exit_code = table.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(exit_code, 0);

    // once the entry is TERMINATED the captured output is final
    let (stdout, stderr) = table.captured_output(pid).unwrap();
    assert_eq!(String::from_utf8_lossy(&stdout), "captured output\n");
    assert!(stderr.is_empty());

    let info = table.get_info(pid).unwrap();
    assert_eq!(info.state, ProcessState::Terminated);
    assert_eq!(info.exit_code, Some(0));
    assert!(info.end_time.is_some());
}

#[test]
fn test_unknown_command_is_rejected_before_spawn() {
    let table = ProcessTable::new();
    match table.spawn(request("definitely-not-a-real-command-kos")) {
        Err(SpawnError::CommandNotFound(_)) => {}
        other => panic!("expected CommandNotFound, got {other:?}"),
    }
    match table.spawn(request("/does/not/exist/anywhere")) {
        Err(SpawnError::CommandNotFound(_)) => {}
        other => panic!("expected CommandNotFound, got {other:?}"),
    }
}

#[test]
fn test_termination_by_signal_reports_negative_code() {
    let table = ProcessTable::new();
    let pid = table.spawn(request("sleep 30")).unwrap();
    table.terminate(pid, false).unwrap();
    let exit_code = table.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(exit_code, -15);
    assert!(!table.process_exists(pid));
}

#[test]
fn test_wait_times_out_on_live_process() {
    let table = ProcessTable::new();
    let pid = table.spawn(request("sleep 30")).unwrap();
    assert!(table.wait(pid, Some(Duration::from_millis(200))).is_err());
    table.terminate(pid, true).unwrap();
    table.wait(pid, Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_parent_child_links() {
    let table = ProcessTable::new();
    let parent = table.spawn(request("sleep 5")).unwrap();
    let mut child_req = request("sleep 5");
    child_req.parent_pid = Some(parent);
    let child = table.spawn(child_req).unwrap();

    assert_eq!(table.children_of(parent).unwrap(), vec![child]);
    assert_eq!(table.get_info(child).unwrap().parent_pid, Some(parent));

    table.terminate(parent, true).unwrap();
    table.terminate(child, true).unwrap();
}

#[test]
fn test_suspend_and_resume_transitions() {
    let table = ProcessTable::new();
    let pid = table.spawn(request("sleep 5")).unwrap();

    table.suspend(pid).unwrap();
    assert_eq!(table.get_info(pid).unwrap().state, ProcessState::Waiting);

    table.resume(pid).unwrap();
    assert_eq!(table.get_info(pid).unwrap().state, ProcessState::Ready);

    table.terminate(pid, true).unwrap();
    table.wait(pid, Some(Duration::from_secs(10))).unwrap();
}

#[test]
fn test_callbacks_fire_on_state_changes() {
    let table = ProcessTable::new();
    let seen: Arc<Mutex<Vec<(u32, ProcessState)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    table.register_callback(
        None,
        Arc::new(move |pid, state| sink.lock().unwrap().push((pid, state))),
    );

    let pid = table.spawn(request("true")).unwrap();
    table.wait(pid, Some(Duration::from_secs(10))).unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(pid, ProcessState::Ready)));
    assert!(seen.contains(&(pid, ProcessState::Terminated)));
}

#[test]
fn test_environment_reaches_the_child() {
    let table = ProcessTable::new();
    let mut req = request("env");
    let mut environment: HashMap<String, String> = std::env::vars().collect();
    environment.insert("KOS_TEST_MARKER".into(), "present".into());
    req.environment = environment;
    let pid = table.spawn(req).unwrap();
    table.wait(pid, Some(Duration::from_secs(10))).unwrap();
    let (stdout, _) = table.captured_output(pid).unwrap();
    assert!(String::from_utf8_lossy(&stdout).contains("KOS_TEST_MARKER=present"));
}
