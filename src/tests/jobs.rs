use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ipc::PipeRegistry;
use crate::process::ProcessTable;
use crate::runtime_info::StopToken;
use crate::scheduler::{JobConfig, JobRegistry, JobStatus, SchedulerError};

struct Harness {
    _dir: tempfile::TempDir,
    registry: Arc<JobRegistry>,
    stop: Arc<StopToken>,
    executor: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let state_dir = dir.path().join("state");
        let history_dir = dir.path().join("history");
        let pipe_dir = dir.path().join("pipes");
        for d in [&config_dir, &state_dir, &history_dir, &pipe_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        let registry = Arc::new(JobRegistry::new(
            config_dir,
            state_dir,
            history_dir,
            Arc::new(ProcessTable::new()),
            Arc::new(PipeRegistry::new(pipe_dir)),
            Arc::new(Mutex::new(std::env::vars().collect::<HashMap<_, _>>())),
        ));
        let stop = Arc::new(StopToken::new());
        let executor = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || registry.run_executor_loop(&stop))
        };
        Self {
            _dir: dir,
            registry,
            stop,
            executor: Some(executor),
        }
    }

    fn wait_for_status(&self, name: &str, expected: JobStatus, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            let status = self.registry.snapshot(name).unwrap().status;
            if status == expected {
                return;
            }
            if Instant::now() > deadline {
                panic!("job {name} stuck in {status:?}, expected {expected:?}");
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
    }
}

fn job(name: &str, command: &str, schedule: Option<&str>) -> JobConfig {
    JobConfig {
        id: String::new(),
        name: name.into(),
        command: command.into(),
        schedule: schedule.map(Into::into),
        enabled: true,
        working_directory: None,
        environment: HashMap::new(),
        user: None,
        description: None,
    }
}

#[test]
fn test_run_now_writes_history_and_counters() {
    let h = Harness::new();
    h.registry
        .create(job("echo-hi", "echo hi", Some("@hourly")))
        .unwrap();
    h.registry.run_now("echo-hi").unwrap();
    h.wait_for_status("echo-hi", JobStatus::Succeeded, Duration::from_secs(15));

    let snapshot = h.registry.snapshot("echo-hi").unwrap();
    assert_eq!(snapshot.run_count, 1);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.fail_count, 0);
    assert_eq!(snapshot.last_exit_code, Some(0));
    assert!(snapshot.last_run_duration.is_some());
    assert!(snapshot.current_pid.is_none());
    assert!(snapshot.next_run_time.is_some());

    let history = h.registry.history("echo-hi", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exit_code, Some(0));
    assert!(history[0].stdout.contains("hi"));
    assert_eq!(history[0].status, JobStatus::Succeeded);
}

#[test]
fn test_failing_command_counts_as_failure() {
    let h = Harness::new();
    h.registry.create(job("falsy", "false", None)).unwrap();
    h.registry.run_now("falsy").unwrap();
    h.wait_for_status("falsy", JobStatus::Failed, Duration::from_secs(15));

    let snapshot = h.registry.snapshot("falsy").unwrap();
    assert_eq!(snapshot.fail_count, 1);
    assert_eq!(snapshot.success_count, 0);
    assert_eq!(snapshot.last_exit_code, Some(1));
}

#[test]
fn test_cancel_running_job() {
    let h = Harness::new();
    h.registry
        .create(job("long-runner", "sleep 30", None))
        .unwrap();
    h.registry.run_now("long-runner").unwrap();
    // wait until the job is running and its pid is on record
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot = h.registry.snapshot("long-runner").unwrap();
        if snapshot.status == JobStatus::Running && snapshot.current_pid.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "job never started");
        std::thread::sleep(Duration::from_millis(100));
    }

    h.registry.cancel("long-runner").unwrap();
    let snapshot = h.registry.snapshot("long-runner").unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.current_pid.is_none());
}

#[test]
fn test_cancel_idle_job_is_rejected() {
    let h = Harness::new();
    h.registry.create(job("idle", "sleep 1", None)).unwrap();
    match h.registry.cancel("idle") {
        Err(SchedulerError::NotRunning(_)) => {}
        other => panic!("expected NotRunning, got {other:?}"),
    }
}

#[test]
fn test_bad_schedule_is_rejected() {
    let h = Harness::new();
    match h.registry.create(job("broken", "true", Some("not a cron"))) {
        Err(SchedulerError::BadSchedule(_, _)) => {}
        other => panic!("expected BadSchedule, got {other:?}"),
    }
}

#[test]
fn test_disabled_job_has_no_next_run() {
    let h = Harness::new();
    h.registry
        .create(job("paused", "true", Some("*/5 * * * *")))
        .unwrap();
    assert!(h.registry.snapshot("paused").unwrap().next_run_time.is_some());

    h.registry.enable("paused", false).unwrap();
    let snapshot = h.registry.snapshot("paused").unwrap();
    assert!(!snapshot.enabled);
    assert!(snapshot.next_run_time.is_none());

    h.registry.enable("paused", true).unwrap();
    assert!(h.registry.snapshot("paused").unwrap().next_run_time.is_some());
}

#[test]
fn test_update_replaces_command_and_schedule() {
    let h = Harness::new();
    h.registry
        .create(job("mutable", "true", Some("@daily")))
        .unwrap();
    h.registry
        .update(
            "mutable",
            Some("echo changed".into()),
            Some(Some("@hourly".into())),
        )
        .unwrap();
    let snapshot = h.registry.snapshot("mutable").unwrap();
    assert_eq!(snapshot.command, "echo changed");
    assert_eq!(snapshot.schedule.as_deref(), Some("@hourly"));
}

#[test]
fn test_tick_does_not_queue_jobs_before_their_time() {
    let h = Harness::new();
    // next run is at least the next whole minute away
    h.registry
        .create(job("later", "true", Some("@hourly")))
        .unwrap();
    h.registry.tick();
    std::thread::sleep(Duration::from_millis(300));
    let snapshot = h.registry.snapshot("later").unwrap();
    assert_eq!(snapshot.run_count, 0);
}

#[test]
fn test_state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    let state_dir = dir.path().join("state");
    let history_dir = dir.path().join("history");
    let pipe_dir = dir.path().join("pipes");
    for d in [&config_dir, &state_dir, &history_dir, &pipe_dir] {
        std::fs::create_dir_all(d).unwrap();
    }
    let make_registry = || {
        Arc::new(JobRegistry::new(
            config_dir.clone(),
            state_dir.clone(),
            history_dir.clone(),
            Arc::new(ProcessTable::new()),
            Arc::new(PipeRegistry::new(pipe_dir.clone())),
            Arc::new(Mutex::new(std::env::vars().collect::<HashMap<_, _>>())),
        ))
    };

    let registry = make_registry();
    let stop = Arc::new(StopToken::new());
    let executor = {
        let registry = registry.clone();
        let stop = stop.clone();
        std::thread::spawn(move || registry.run_executor_loop(&stop))
    };
    let id = registry
        .create(job("persistent", "echo done", Some("@hourly")))
        .unwrap();
    registry.run_now("persistent").unwrap();
    let deadline = Instant::now() + Duration::from_secs(15);
    while registry.snapshot("persistent").unwrap().status != JobStatus::Succeeded {
        assert!(Instant::now() < deadline, "job never finished");
        std::thread::sleep(Duration::from_millis(100));
    }
    stop.stop();
    executor.join().unwrap();

    let reloaded = make_registry();
    reloaded.load_all();
    let snapshot = reloaded.snapshot("persistent").unwrap();
    assert_eq!(snapshot.id, id);
    assert_eq!(snapshot.status, JobStatus::Succeeded);
    assert_eq!(snapshot.run_count, 1);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(reloaded.history("persistent", 10).unwrap().len(), 1);
}
