use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::KosConfig;
use crate::runtime_info::RuntimeInfo;
use crate::syscall::{SyscallError, SyscallRegistry};

struct Harness {
    _dir: tempfile::TempDir,
    runtime: Arc<RuntimeInfo>,
    syscalls: SyscallRegistry,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let runtime = RuntimeInfo::init(KosConfig::new(dir.path())).unwrap();
    let syscalls = runtime.syscalls();
    Harness {
        _dir: dir,
        runtime,
        syscalls,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}

#[test]
fn test_unknown_syscall_is_not_found() {
    let h = harness();
    let result = h.syscalls.invoke_positional("ipc.no_such_call", vec![]);
    assert!(!result.success);
    assert_eq!(result.error_code, SyscallError::NotFound);
}

#[test]
fn test_canonical_ids_are_registered() {
    let h = harness();
    let ids = h.syscalls.ids();
    for id in [
        "process.create_process",
        "process.terminate_process",
        "process.get_process_info",
        "process.get_all_processes",
        "process.set_process_priority",
        "process.suspend_process",
        "process.resume_process",
        "process.wait_process",
        "process.get_process_children",
        "process.send_signal",
        "ipc.create_pipe",
        "ipc.close_pipe",
        "ipc.write_pipe",
        "ipc.read_pipe",
        "ipc.create_message_queue",
        "ipc.delete_message_queue",
        "ipc.send_message",
        "ipc.receive_message",
        "ipc.create_shared_memory",
        "ipc.delete_shared_memory",
        "ipc.read_shared_memory",
        "ipc.write_shared_memory",
        "ipc.create_semaphore",
        "ipc.delete_semaphore",
        "ipc.acquire_semaphore",
        "ipc.release_semaphore",
        "ipc.send_signal_to_process",
        "ipc.register_signal_handler",
        "system.get_system_info",
        "system.get_environment_variable",
        "system.set_environment_variable",
        "system.get_all_environment_variables",
        "system.get_current_time",
        "system.sleep",
        "system.get_system_load",
        "system.shutdown_system",
        "system.get_system_uptime",
        "system.get_hostname",
        "system.set_hostname",
        "filesystem.mount_filesystem",
        "filesystem.unmount_filesystem",
        "filesystem.get_mounted_filesystems",
        "filesystem.create_file",
        "filesystem.delete_file",
        "filesystem.create_directory",
        "filesystem.delete_directory",
        "filesystem.list_directory",
        "filesystem.get_file_info",
        "filesystem.read_file",
        "filesystem.write_file",
        "filesystem.copy_file",
        "filesystem.move_file",
        "filesystem.rename",
        "system.create_service",
        "system.delete_service",
        "system.start_service",
        "system.stop_service",
        "system.restart_service",
        "system.reload_service",
        "system.list_services",
        "system.get_service_status",
        "time.create_job",
        "time.delete_job",
        "time.enable_job",
        "time.update_job",
        "time.run_job_now",
        "time.cancel_job",
        "time.list_jobs",
        "time.get_job_status",
        "time.get_job_history",
    ] {
        assert!(ids.contains(&id.to_string()), "missing syscall {id}");
    }
}

#[test]
fn test_argument_binding_failures() {
    let h = harness();

    // missing required parameter
    let result = h.syscalls.invoke_positional("ipc.write_pipe", vec![json!("some-id")]);
    assert_eq!(result.error_code, SyscallError::InvalidArgument);

    // too many positional arguments
    let result = h.syscalls.invoke_positional(
        "system.get_current_time",
        vec![json!(1), json!(2)],
    );
    assert_eq!(result.error_code, SyscallError::InvalidArgument);

    // unknown keyword
    let mut keyword = HashMap::new();
    keyword.insert("bogus".to_string(), json!(1));
    let result = h.syscalls.invoke("system.get_current_time", vec![], keyword);
    assert_eq!(result.error_code, SyscallError::InvalidArgument);

    // duplicate between positional and keyword
    let mut keyword = HashMap::new();
    keyword.insert("name".to_string(), json!("twice"));
    let result = h
        .syscalls
        .invoke("ipc.create_pipe", vec![json!("once")], keyword);
    assert_eq!(result.error_code, SyscallError::InvalidArgument);

    // wrong type for a bound parameter
    let result = h.syscalls.invoke_positional(
        "ipc.create_pipe",
        vec![Value::Null, json!("not a number")],
    );
    assert_eq!(result.error_code, SyscallError::InvalidArgument);
}

#[test]
fn test_pipe_roundtrip_through_dispatcher() {
    let h = harness();
    let created = h
        .syscalls
        .invoke_positional("ipc.create_pipe", vec![json!("dispatch"), json!(64)]);
    assert!(created.success);
    let id = created.data.as_str().unwrap().to_string();

    let written = h
        .syscalls
        .invoke_positional("ipc.write_pipe", vec![json!(id), json!("hello")]);
    assert!(written.success);
    assert_eq!(written.data, json!(5));

    let read = h
        .syscalls
        .invoke_positional("ipc.read_pipe", vec![json!(id), json!(16)]);
    assert!(read.success);
    assert_eq!(read.data, json!("hello"));

    let closed = h.syscalls.invoke_positional("ipc.close_pipe", vec![json!(id)]);
    assert!(closed.success);
}

#[test]
fn test_queue_error_codes_match_the_contract() {
    let h = harness();
    let id = h
        .syscalls
        .invoke_positional(
            "ipc.create_message_queue",
            vec![Value::Null, json!(1), json!(4096)],
        )
        .data
        .as_str()
        .unwrap()
        .to_string();

    // empty queue, nonblocking receive
    let mut keyword = HashMap::new();
    keyword.insert("blocking".to_string(), json!(false));
    let result = h
        .syscalls
        .invoke("ipc.receive_message", vec![json!(id)], keyword);
    assert_eq!(result.error_code, SyscallError::ResourceUnavailable);

    // fill the single slot, then a nonblocking send must report busy
    let sent = h
        .syscalls
        .invoke_positional("ipc.send_message", vec![json!(id), json!({"k": "v"})]);
    assert!(sent.success);
    let mut keyword = HashMap::new();
    keyword.insert("blocking".to_string(), json!(false));
    let result = h.syscalls.invoke(
        "ipc.send_message",
        vec![json!(id), json!("overflow")],
        keyword,
    );
    assert_eq!(result.error_code, SyscallError::ResourceBusy);

    // the dict payload comes back intact
    let received = h
        .syscalls
        .invoke_positional("ipc.receive_message", vec![json!(id)]);
    assert!(received.success);
    assert_eq!(received.data["data"], json!({"k": "v"}));
}

#[test]
fn test_semaphore_timeout_through_dispatcher() {
    let h = harness();
    let id = h
        .syscalls
        .invoke_positional("ipc.create_semaphore", vec![Value::Null, json!(1), json!(1)])
        .data
        .as_str()
        .unwrap()
        .to_string();

    assert!(h
        .syscalls
        .invoke_positional("ipc.acquire_semaphore", vec![json!(id)])
        .success);

    let mut keyword = HashMap::new();
    keyword.insert("timeout".to_string(), json!(0.2));
    let result = h
        .syscalls
        .invoke("ipc.acquire_semaphore", vec![json!(id)], keyword);
    assert_eq!(result.error_code, SyscallError::Timeout);

    assert!(h
        .syscalls
        .invoke_positional("ipc.release_semaphore", vec![json!(id)])
        .success);
    let value = h
        .syscalls
        .invoke_positional("ipc.get_semaphore_value", vec![json!(id)]);
    assert_eq!(value.data, json!(1));
}

#[test]
fn test_unknown_command_spawns_not_found() {
    let h = harness();
    let result = h.syscalls.invoke_positional(
        "process.create_process",
        vec![json!("ghost"), json!("definitely-not-a-real-command-kos")],
    );
    assert!(!result.success);
    assert_eq!(result.error_code, SyscallError::NotFound);
}

#[test]
fn test_process_lifecycle_through_dispatcher() {
    let h = harness();
    let created = h.syscalls.invoke_positional(
        "process.create_process",
        vec![json!("quick"), json!("echo dispatched")],
    );
    assert!(created.success);
    let pid = created.data.as_u64().unwrap();

    let waited = h
        .syscalls
        .invoke_positional("process.wait_process", vec![json!(pid)]);
    assert!(waited.success);
    assert_eq!(waited.data["exit_code"], json!(0));

    let info = h
        .syscalls
        .invoke_positional("process.get_process_info", vec![json!(pid)]);
    assert!(info.success);
    assert_eq!(info.data["state"], json!("TERMINATED"));

    let all = h
        .syscalls
        .invoke_positional("process.get_all_processes", vec![]);
    assert!(all.data.get(pid.to_string()).is_some());
}

#[test]
fn test_service_lifecycle_through_dispatcher() {
    let h = harness();
    let created = h.syscalls.invoke_positional(
        "system.create_service",
        vec![json!("web"), json!("sleep 30")],
    );
    assert!(created.success);
    assert!(created.data.as_str().is_some());

    let duplicate = h.syscalls.invoke_positional(
        "system.create_service",
        vec![json!("web"), json!("sleep 30")],
    );
    assert_eq!(duplicate.error_code, SyscallError::AlreadyExists);

    assert!(h
        .syscalls
        .invoke_positional("system.start_service", vec![json!("web")])
        .success);
    let status = h
        .syscalls
        .invoke_positional("system.get_service_status", vec![json!("web")]);
    assert_eq!(status.data["state"], json!("RUNNING"));
    assert!(status.data["pid"].as_u64().is_some());

    let listed = h.syscalls.invoke_positional("system.list_services", vec![]);
    assert_eq!(listed.data.as_array().unwrap().len(), 1);
    assert_eq!(listed.data[0]["name"], json!("web"));

    // reloading a running service keeps it running
    assert!(h
        .syscalls
        .invoke_positional("system.reload_service", vec![json!("web")])
        .success);

    assert!(h
        .syscalls
        .invoke_positional("system.stop_service", vec![json!("web")])
        .success);
    let status = h
        .syscalls
        .invoke_positional("system.get_service_status", vec![json!("web")]);
    assert_eq!(status.data["state"], json!("INACTIVE"));

    // reload now hits the INVALID_STATE leg of the taxonomy
    let reload = h
        .syscalls
        .invoke_positional("system.reload_service", vec![json!("web")]);
    assert_eq!(reload.error_code, SyscallError::InvalidState);

    assert!(h
        .syscalls
        .invoke_positional("system.delete_service", vec![json!("web")])
        .success);
    let missing = h
        .syscalls
        .invoke_positional("system.start_service", vec![json!("web")]);
    assert_eq!(missing.error_code, SyscallError::NotFound);
}

#[test]
fn test_job_lifecycle_through_dispatcher() {
    let h = harness();
    let created = h.syscalls.invoke_positional(
        "time.create_job",
        vec![json!("hello"), json!("echo hi"), json!("@hourly")],
    );
    assert!(created.success);

    let bad = h.syscalls.invoke_positional(
        "time.create_job",
        vec![json!("broken"), json!("true"), json!("not a cron")],
    );
    assert_eq!(bad.error_code, SyscallError::InvalidArgument);

    assert!(h
        .syscalls
        .invoke_positional("time.run_job_now", vec![json!("hello")])
        .success);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
    loop {
        let status = h
            .syscalls
            .invoke_positional("time.get_job_status", vec![json!("hello")]);
        if status.data["status"] == json!("SUCCEEDED") {
            assert_eq!(status.data["run_count"], json!(1));
            assert_eq!(status.data["success_count"], json!(1));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "job never finished");
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let history = h
        .syscalls
        .invoke_positional("time.get_job_history", vec![json!("hello")]);
    assert_eq!(history.data.as_array().unwrap().len(), 1);
    assert!(history.data[0]["stdout"].as_str().unwrap().contains("hi"));

    // cancelling an idle job is an INVALID_STATE error
    let cancel = h
        .syscalls
        .invoke_positional("time.cancel_job", vec![json!("hello")]);
    assert_eq!(cancel.error_code, SyscallError::InvalidState);

    assert!(h
        .syscalls
        .invoke_positional("time.enable_job", vec![json!("hello"), json!(false)])
        .success);
    let status = h
        .syscalls
        .invoke_positional("time.get_job_status", vec![json!("hello")]);
    assert_eq!(status.data["enabled"], json!(false));
    assert_eq!(status.data["next_run_time"], Value::Null);

    assert!(h
        .syscalls
        .invoke_positional(
            "time.update_job",
            vec![json!("hello"), json!("echo changed")],
        )
        .success);
    let listed = h.syscalls.invoke_positional("time.list_jobs", vec![]);
    assert_eq!(listed.data[0]["command"], json!("echo changed"));

    assert!(h
        .syscalls
        .invoke_positional("time.delete_job", vec![json!("hello")])
        .success);
    let missing = h
        .syscalls
        .invoke_positional("time.get_job_status", vec![json!("hello")]);
    assert_eq!(missing.error_code, SyscallError::NotFound);
}

#[test]
fn test_memory_stubs_return_not_implemented() {
    let h = harness();
    let result = h
        .syscalls
        .invoke_positional("memory.allocate_memory", vec![]);
    assert!(!result.success);
    assert_eq!(result.error_code, SyscallError::NotImplemented);
}

#[test]
fn test_environment_and_hostname_are_emulated() {
    let h = harness();
    assert!(h
        .syscalls
        .invoke_positional(
            "system.set_environment_variable",
            vec![json!("KOS_FLAVOR"), json!("kaede")],
        )
        .success);
    let value = h.syscalls.invoke_positional(
        "system.get_environment_variable",
        vec![json!("KOS_FLAVOR")],
    );
    assert_eq!(value.data, json!("kaede"));
    // the host environment is untouched
    assert!(std::env::var("KOS_FLAVOR").is_err());

    assert!(h
        .syscalls
        .invoke_positional("system.set_hostname", vec![json!("kos-test-host")])
        .success);
    let hostname = h.syscalls.invoke_positional("system.get_hostname", vec![]);
    assert_eq!(hostname.data, json!("kos-test-host"));

    let time = h.syscalls.invoke_positional("system.get_current_time", vec![]);
    assert!(time.data.as_f64().unwrap() > 0.0);
    let uptime = h.syscalls.invoke_positional("system.get_system_uptime", vec![]);
    assert!(uptime.data.as_f64().unwrap() >= 0.0);
}

#[test]
fn test_mount_table_bookkeeping() {
    let h = harness();
    assert!(h
        .syscalls
        .invoke_positional(
            "filesystem.mount_filesystem",
            vec![json!("tmpfs"), json!("/mnt/scratch")],
        )
        .success);
    let result = h.syscalls.invoke_positional(
        "filesystem.mount_filesystem",
        vec![json!("tmpfs"), json!("/mnt/scratch")],
    );
    assert_eq!(result.error_code, SyscallError::AlreadyExists);

    let mounts = h
        .syscalls
        .invoke_positional("filesystem.get_mounted_filesystems", vec![]);
    assert_eq!(mounts.data["/mnt/scratch"]["fs_type"], json!("tmpfs"));

    assert!(h
        .syscalls
        .invoke_positional("filesystem.unmount_filesystem", vec![json!("/mnt/scratch")])
        .success);
    let result = h
        .syscalls
        .invoke_positional("filesystem.unmount_filesystem", vec![json!("/mnt/scratch")]);
    assert_eq!(result.error_code, SyscallError::NotFound);
}

#[test]
fn test_file_syscalls_roundtrip() {
    let h = harness();
    let base = h._dir.path().join("fs-playground");
    std::fs::create_dir_all(&base).unwrap();
    let cwd = base.display().to_string();
    let with_cwd = || {
        let mut keyword = HashMap::new();
        keyword.insert("cwd".to_string(), json!(cwd.clone()));
        keyword
    };

    assert!(h
        .syscalls
        .invoke("filesystem.create_file", vec![json!("a.txt")], with_cwd())
        .success);

    assert!(h
        .syscalls
        .invoke(
            "filesystem.write_file",
            vec![json!("a.txt"), json!("file content")],
            with_cwd(),
        )
        .success);

    let read = h
        .syscalls
        .invoke("filesystem.read_file", vec![json!("a.txt")], with_cwd());
    assert_eq!(read.data, json!("file content"));

    assert!(h
        .syscalls
        .invoke_positional(
            "filesystem.copy_file",
            vec![
                json!(base.join("a.txt").display().to_string()),
                json!(base.join("b.txt").display().to_string()),
            ],
        )
        .success);

    let listed = h.syscalls.invoke_positional(
        "filesystem.list_directory",
        vec![json!(base.display().to_string())],
    );
    assert!(listed.success);
    assert_eq!(listed.data.as_array().unwrap().len(), 2);

    assert!(h
        .syscalls
        .invoke(
            "filesystem.rename",
            vec![json!("b.txt"), json!("c.txt")],
            with_cwd(),
        )
        .success);
    assert!(base.join("c.txt").exists());

    let info = h.syscalls.invoke_positional(
        "filesystem.get_file_info",
        vec![json!(base.join("a.txt").display().to_string())],
    );
    assert_eq!(info.data["is_file"], json!(true));
    assert_eq!(info.data["size"], json!(12));
}
