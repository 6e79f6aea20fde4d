use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};
use serde::Serialize;

use super::cron::CronExpression;
use super::job::{HistoryRecord, Job, JobConfig, JobStatus};
use crate::ipc::PipeRegistry;
use crate::process::ProcessTable;
use crate::runtime_info::StopToken;

/// SIGTERM grace on cancellation: five polls half a second apart.
const CANCEL_POLLS: u32 = 5;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum SchedulerError {
    NotFound(String),
    AlreadyExists(String),
    BadSchedule(String, String),
    NotRunning(String),
    Io(String, std::io::Error),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(fmt, "job {name} does not exist"),
            Self::AlreadyExists(name) => write!(fmt, "job {name} already exists"),
            Self::BadSchedule(name, err) => write!(fmt, "invalid schedule for job {name}: {err}"),
            Self::NotRunning(name) => write!(fmt, "job {name} is not running"),
            Self::Io(name, err) => write!(fmt, "io error for job {name}: {err}"),
        }
    }
}

/// Status snapshot of one job.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub name: String,
    pub command: String,
    pub schedule: Option<String>,
    pub enabled: bool,
    pub description: Option<String>,
    pub status: JobStatus,
    pub last_run_time: Option<String>,
    pub next_run_time: Option<String>,
    pub last_run_duration: Option<f64>,
    pub last_exit_code: Option<i32>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub current_pid: Option<u32>,
}

/// Owner of every scheduled job. The scheduler thread marks due jobs
/// PENDING at the top of each minute; the executor thread drains the FIFO
/// queue and runs one job at a time.
pub struct JobRegistry {
    config_dir: PathBuf,
    state_dir: PathBuf,
    history_dir: PathBuf,
    jobs: Mutex<HashMap<String, Arc<Mutex<Job>>>>,
    queue: Mutex<VecDeque<String>>,
    queued: Condvar,
    processes: Arc<ProcessTable>,
    pipes: Arc<PipeRegistry>,
    environment: Arc<Mutex<HashMap<String, String>>>,
}

impl JobRegistry {
    pub fn new(
        config_dir: PathBuf,
        state_dir: PathBuf,
        history_dir: PathBuf,
        processes: Arc<ProcessTable>,
        pipes: Arc<PipeRegistry>,
        environment: Arc<Mutex<HashMap<String, String>>>,
    ) -> Self {
        Self {
            config_dir,
            state_dir,
            history_dir,
            jobs: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queued: Condvar::new(),
            processes,
            pipes,
            environment,
        }
    }

    pub fn load_all(&self) {
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!("cannot list scheduler config dir: {err}");
                return;
            }
        };
        let mut jobs = self.jobs.lock().unwrap();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e != "job").unwrap_or(true) {
                continue;
            }
            match Job::load(&path, &self.state_dir) {
                Ok(job) => {
                    info!("Loaded job {}", job.config.name);
                    jobs.insert(job.config.name.clone(), Arc::new(Mutex::new(job)));
                }
                Err(err) => error!("failed to load job from {}: {err}", path.display()),
            }
        }
        info!("Loaded {} jobs", jobs.len());
    }

    /// Register a new job. The `id` field of `config` is assigned here;
    /// the schedule (when given) must parse.
    pub fn create(&self, mut config: JobConfig) -> Result<String, SchedulerError> {
        let cron = match &config.schedule {
            Some(schedule) => Some(CronExpression::parse(schedule).map_err(|err| {
                SchedulerError::BadSchedule(config.name.clone(), err.to_string())
            })?),
            None => None,
        };
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&config.name) {
            return Err(SchedulerError::AlreadyExists(config.name));
        }
        config.id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(config, cron);
        job.save_config(&self.config_dir)
            .map_err(|err| SchedulerError::Io(job.config.name.clone(), err))?;
        job.save_state(&self.state_dir);
        let id = job.config.id.clone();
        info!("Created job {}", job.config.name);
        jobs.insert(job.config.name.clone(), Arc::new(Mutex::new(job)));
        Ok(id)
    }

    fn get(&self, name: &str) -> Result<Arc<Mutex<Job>>, SchedulerError> {
        self.jobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    /// Cancel (if running) and remove a job, its state and its history.
    pub fn delete(&self, name: &str) -> Result<(), SchedulerError> {
        let handle = self.get(name)?;
        {
            let job = handle.lock().unwrap();
            if job.status == JobStatus::Running {
                drop(job);
                let _ = self.cancel(name);
            }
        }
        self.jobs.lock().unwrap().remove(name);
        self.queue.lock().unwrap().retain(|queued| queued != name);
        let _ = std::fs::remove_file(Job::config_path(&self.config_dir, name));
        let _ = std::fs::remove_file(Job::state_path(&self.state_dir, name));
        let _ = std::fs::remove_dir_all(Job::history_dir(&self.history_dir, name));
        info!("Deleted job {name}");
        Ok(())
    }

    pub fn enable(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        let handle = self.get(name)?;
        let mut job = handle.lock().unwrap();
        job.config.enabled = enabled;
        job.update_next_run_time();
        job.save_config(&self.config_dir)
            .map_err(|err| SchedulerError::Io(name.to_string(), err))?;
        job.save_state(&self.state_dir);
        info!("Job {name} {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Update command and/or schedule of an existing job.
    pub fn update(
        &self,
        name: &str,
        command: Option<String>,
        schedule: Option<Option<String>>,
    ) -> Result<(), SchedulerError> {
        let handle = self.get(name)?;
        let mut job = handle.lock().unwrap();
        if let Some(command) = command {
            job.config.command = command;
        }
        if let Some(schedule) = schedule {
            job.cron = match &schedule {
                Some(expr) => Some(
                    CronExpression::parse(expr)
                        .map_err(|err| SchedulerError::BadSchedule(name.to_string(), err.to_string()))?,
                ),
                None => None,
            };
            job.config.schedule = schedule;
            job.update_next_run_time();
        }
        job.save_config(&self.config_dir)
            .map_err(|err| SchedulerError::Io(name.to_string(), err))?;
        job.save_state(&self.state_dir);
        Ok(())
    }

    /// Enqueue a job for immediate execution.
    pub fn run_now(&self, name: &str) -> Result<(), SchedulerError> {
        let handle = self.get(name)?;
        {
            let mut job = handle.lock().unwrap();
            if matches!(job.status, JobStatus::Running | JobStatus::Pending) {
                debug!("job {name} is already queued or running");
                return Ok(());
            }
            job.status = JobStatus::Pending;
            job.save_state(&self.state_dir);
        }
        self.enqueue(name);
        Ok(())
    }

    fn enqueue(&self, name: &str) {
        let mut queue = self.queue.lock().unwrap();
        if !queue.iter().any(|queued| queued == name) {
            queue.push_back(name.to_string());
        }
        self.queued.notify_all();
    }

    /// Cancel a running job: SIGTERM, a short grace period, then SIGKILL.
    pub fn cancel(&self, name: &str) -> Result<(), SchedulerError> {
        let handle = self.get(name)?;
        let pid = {
            let job = handle.lock().unwrap();
            match (job.status, job.current_pid) {
                (JobStatus::Running, Some(pid)) => pid,
                _ => return Err(SchedulerError::NotRunning(name.to_string())),
            }
        };
        info!("Cancelling job {name} (pid {pid})");
        if let Err(err) = self.processes.terminate(pid, false) {
            warn!("SIGTERM for job {name} failed: {err}");
        }
        for _ in 0..CANCEL_POLLS {
            if !self.processes.process_exists(pid) {
                break;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL);
            self.processes.reap_once();
        }
        if self.processes.process_exists(pid) {
            let _ = self.processes.terminate(pid, true);
        }
        let mut job = handle.lock().unwrap();
        job.status = JobStatus::Cancelled;
        job.fail_count += 1;
        job.current_pid = None;
        job.update_next_run_time();
        job.save_state(&self.state_dir);
        info!("Job {name} cancelled");
        Ok(())
    }

    pub fn snapshot(&self, name: &str) -> Result<JobSnapshot, SchedulerError> {
        let handle = self.get(name)?;
        let job = handle.lock().unwrap();
        Ok(snapshot_of(&job))
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        let handles: Vec<Arc<Mutex<Job>>> = self.jobs.lock().unwrap().values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = handles
            .iter()
            .map(|handle| snapshot_of(&handle.lock().unwrap()))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<HistoryRecord>, SchedulerError> {
        let handle = self.get(name)?;
        let job = handle.lock().unwrap();
        Ok(job.history(&self.history_dir, limit))
    }

    /// One scheduler tick: queue every enabled job whose next run time has
    /// arrived and that is not already queued or running.
    pub fn tick(&self) {
        let now = Local::now();
        let due: Vec<String> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.iter()
                .filter_map(|(name, handle)| {
                    let job = handle.lock().unwrap();
                    let due = job.config.enabled
                        && !matches!(job.status, JobStatus::Running | JobStatus::Pending)
                        && job.next_run_time.map(|next| next <= now).unwrap_or(false);
                    if due {
                        Some(name.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for name in due {
            debug!("job {name} is due");
            if let Ok(handle) = self.get(&name) {
                let mut job = handle.lock().unwrap();
                job.status = JobStatus::Pending;
                job.save_state(&self.state_dir);
            }
            self.enqueue(&name);
        }
    }

    /// Scheduler thread: one tick at startup, then one at the top of each
    /// minute. The stop token is polled every second.
    pub fn run_scheduler_loop(&self, stop: &StopToken) {
        info!("job scheduler started");
        let mut last_tick = Local::now().timestamp() / 60;
        self.tick();
        while !stop.sleep_slices(Duration::from_secs(1)) {
            let minute = Local::now().timestamp() / 60;
            if minute != last_tick {
                last_tick = minute;
                self.tick();
            }
        }
        info!("job scheduler stopped");
    }

    /// Executor thread: pops job names FIFO and runs them to completion,
    /// one at a time.
    pub fn run_executor_loop(&self, stop: &StopToken) {
        info!("job executor started");
        while !stop.is_stopped() {
            let name = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if let Some(name) = queue.pop_front() {
                        break Some(name);
                    }
                    let (guard, timeout) = self
                        .queued
                        .wait_timeout(queue, Duration::from_secs(1))
                        .unwrap();
                    queue = guard;
                    if timeout.timed_out() {
                        break None;
                    }
                }
            };
            let name = match name {
                Some(name) => name,
                None => continue,
            };
            let handle = match self.get(&name) {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            let base_environment = self.environment.lock().unwrap().clone();
            // the job lock is dropped while the child runs so run_now
            // state reads and cancellation stay responsive
            let run = handle.lock().unwrap().begin_run(
                &self.processes,
                &self.pipes,
                &base_environment,
                &self.state_dir,
            );
            if let Some(run) = run {
                let exit_code = self.processes.wait(run.pid, None).unwrap_or(-1);
                handle.lock().unwrap().finish_run(
                    &self.processes,
                    &self.pipes,
                    run,
                    exit_code,
                    &self.state_dir,
                    &self.history_dir,
                );
            }
        }
        info!("job executor stopped");
    }
}

fn snapshot_of(job: &Job) -> JobSnapshot {
    JobSnapshot {
        id: job.config.id.clone(),
        name: job.config.name.clone(),
        command: job.config.command.clone(),
        schedule: job.config.schedule.clone(),
        enabled: job.config.enabled,
        description: job.config.description.clone(),
        status: job.status,
        last_run_time: job.last_run_time.map(|t| t.to_rfc3339()),
        next_run_time: job.next_run_time.map(|t| t.to_rfc3339()),
        last_run_duration: job.last_run_duration,
        last_exit_code: job.last_exit_code,
        run_count: job.run_count,
        success_count: job.success_count,
        fail_count: job.fail_count,
        current_pid: job.current_pid,
    }
}
