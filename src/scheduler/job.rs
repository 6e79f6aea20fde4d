use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::cron::CronExpression;
use crate::ipc::PipeRegistry;
use crate::persist;
use crate::process::{ProcessPriority, ProcessTable, SpawnRequest};

/// Captured output is truncated to this many bytes per stream.
const HISTORY_CAPTURE_CAP: usize = 1024 * 1024;
/// Buffer size of the KOS pipes advertised to the job via environment.
const JOB_PIPE_SIZE: u32 = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Immutable job definition, persisted as `scheduler/config/<name>.job`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub name: String,
    pub command: String,
    /// Cron expression or `@` macro; `None` means manual-only.
    pub schedule: Option<String>,
    pub enabled: bool,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub user: Option<String>,
    pub description: Option<String>,
}

/// On-disk shape of `scheduler/state/<name>.state`.
#[derive(Serialize, Deserialize)]
struct JobStateFile {
    id: String,
    name: String,
    status: JobStatus,
    last_run_time: Option<DateTime<Local>>,
    next_run_time: Option<DateTime<Local>>,
    last_run_duration: Option<f64>,
    last_exit_code: Option<i32>,
    run_count: u64,
    success_count: u64,
    fail_count: u64,
    current_pid: Option<u32>,
}

/// One execution record under `scheduler/history/<name>/<ts>.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub name: String,
    pub command: String,
    pub status: JobStatus,
    pub start_time: String,
    pub duration: f64,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Per-run bookkeeping handed from `begin_run` to `finish_run`.
pub struct RunHandle {
    pub pid: u32,
    started: Instant,
    stdout_pipe: Option<String>,
    stderr_pipe: Option<String>,
}

pub struct Job {
    pub config: JobConfig,
    pub cron: Option<CronExpression>,
    pub status: JobStatus,
    pub last_run_time: Option<DateTime<Local>>,
    pub next_run_time: Option<DateTime<Local>>,
    pub last_run_duration: Option<f64>,
    pub last_exit_code: Option<i32>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub current_pid: Option<u32>,
}

impl Job {
    pub fn new(config: JobConfig, cron: Option<CronExpression>) -> Self {
        let mut job = Self {
            config,
            cron,
            status: JobStatus::Pending,
            last_run_time: None,
            next_run_time: None,
            last_run_duration: None,
            last_exit_code: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            current_pid: None,
        };
        job.update_next_run_time();
        job
    }

    pub fn config_path(config_dir: &Path, name: &str) -> PathBuf {
        config_dir.join(format!("{name}.job"))
    }

    pub fn state_path(state_dir: &Path, name: &str) -> PathBuf {
        state_dir.join(format!("{name}.state"))
    }

    pub fn history_dir(history_dir: &Path, name: &str) -> PathBuf {
        history_dir.join(name)
    }

    pub fn update_next_run_time(&mut self) {
        self.next_run_time = match (&self.cron, self.config.enabled) {
            (Some(cron), true) => cron
                .next_run_time(&Local::now().naive_local())
                .and_then(|naive| naive.and_local_timezone(Local).single()),
            _ => None,
        };
    }

    pub fn save_config(&self, config_dir: &Path) -> std::io::Result<()> {
        persist::write_json_atomic(&Self::config_path(config_dir, &self.config.name), &self.config)
    }

    pub fn save_state(&self, state_dir: &Path) {
        let state = JobStateFile {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            status: self.status,
            last_run_time: self.last_run_time,
            next_run_time: self.next_run_time,
            last_run_duration: self.last_run_duration,
            last_exit_code: self.last_exit_code,
            run_count: self.run_count,
            success_count: self.success_count,
            fail_count: self.fail_count,
            current_pid: self.current_pid,
        };
        let path = Self::state_path(state_dir, &self.config.name);
        if let Err(err) = persist::write_json_atomic(&path, &state) {
            error!("failed to save state for job {}: {err}", self.config.name);
        }
    }

    /// Reconstruct a job from its config file, folding in persisted state.
    /// A job that was RUNNING or PENDING when the previous instance died
    /// goes back to PENDING; its pid is meaningless now.
    pub fn load(config_path: &Path, state_dir: &Path) -> std::io::Result<Self> {
        let config: JobConfig = persist::read_json(config_path)?;
        let cron = match &config.schedule {
            Some(schedule) => match CronExpression::parse(schedule) {
                Ok(cron) => Some(cron),
                Err(err) => {
                    warn!("job {}: bad schedule {schedule:?}: {err}", config.name);
                    None
                }
            },
            None => None,
        };
        let mut job = Self::new(config, cron);
        let state_path = Self::state_path(state_dir, &job.config.name);
        if state_path.exists() {
            match persist::read_json::<JobStateFile>(&state_path) {
                Ok(state) => {
                    job.status = match state.status {
                        JobStatus::Running | JobStatus::Pending => JobStatus::Pending,
                        other => other,
                    };
                    job.last_run_time = state.last_run_time;
                    job.last_run_duration = state.last_run_duration;
                    job.last_exit_code = state.last_exit_code;
                    job.run_count = state.run_count;
                    job.success_count = state.success_count;
                    job.fail_count = state.fail_count;
                }
                Err(err) => {
                    error!(
                        "refusing corrupt state file for job {}: {err}",
                        job.config.name
                    );
                }
            }
        }
        Ok(job)
    }

    /// Mark the job RUNNING and spawn its process. The executor drops the
    /// job lock between this and `finish_run` so cancellation can slip in
    /// while the child runs. Spawn failure is recorded here and `None`
    /// returned.
    pub fn begin_run(
        &mut self,
        processes: &ProcessTable,
        pipes: &PipeRegistry,
        base_environment: &HashMap<String, String>,
        state_dir: &Path,
    ) -> Option<RunHandle> {
        info!("Running job {}", self.config.name);
        self.status = JobStatus::Running;
        self.last_run_time = Some(Local::now());
        self.current_pid = None;
        self.run_count += 1;
        self.save_state(state_dir);

        let stdout_pipe = pipes
            .create(Some(format!("job_{}_stdout", self.config.id)), JOB_PIPE_SIZE)
            .ok();
        let stderr_pipe = pipes
            .create(Some(format!("job_{}_stderr", self.config.id)), JOB_PIPE_SIZE)
            .ok();

        let mut environment = base_environment.clone();
        environment.extend(self.config.environment.clone());
        environment.insert("KOS_JOB_NAME".into(), self.config.name.clone());
        environment.insert("KOS_JOB_ID".into(), self.config.id.clone());
        if let Some(pipe) = &stdout_pipe {
            environment.insert("KOS_STDOUT_PIPE".into(), pipe.clone());
        }
        if let Some(pipe) = &stderr_pipe {
            environment.insert("KOS_STDERR_PIPE".into(), pipe.clone());
        }

        let started = Instant::now();
        let spawned = processes.spawn(SpawnRequest {
            name: format!("job_{}", self.config.name),
            command: self.config.command.clone(),
            args: Vec::new(),
            environment,
            working_directory: self.config.working_directory.clone(),
            user: self.config.user.clone(),
            priority: ProcessPriority::Normal,
            parent_pid: None,
        });

        match spawned {
            Ok(pid) => {
                self.current_pid = Some(pid);
                self.save_state(state_dir);
                info!("Job {} started with pid {pid}", self.config.name);
                Some(RunHandle {
                    pid,
                    started,
                    stdout_pipe,
                    stderr_pipe,
                })
            }
            Err(err) => {
                error!("failed to start process for job {}: {err}", self.config.name);
                self.status = JobStatus::Failed;
                self.fail_count += 1;
                self.update_next_run_time();
                self.save_state(state_dir);
                self.close_pipes(pipes, &stdout_pipe, &stderr_pipe);
                None
            }
        }
    }

    /// Record the outcome of a finished run: counters, history, next run
    /// time. A cancellation that landed while the child ran wins over the
    /// exit code.
    pub fn finish_run(
        &mut self,
        processes: &ProcessTable,
        pipes: &PipeRegistry,
        run: RunHandle,
        exit_code: i32,
        state_dir: &Path,
        history_dir: &Path,
    ) -> bool {
        let duration = run.started.elapsed().as_secs_f64();
        self.last_run_duration = Some(duration);
        self.last_exit_code = Some(exit_code);
        if self.status == JobStatus::Cancelled {
            debug!("job {} was cancelled mid-run", self.config.name);
        } else if exit_code == 0 {
            self.status = JobStatus::Succeeded;
            self.success_count += 1;
        } else {
            self.status = JobStatus::Failed;
            self.fail_count += 1;
        }

        let (stdout, stderr) = processes
            .captured_output(run.pid)
            .map(|(out, err)| (truncate(out), truncate(err)))
            .unwrap_or_default();

        self.save_history(history_dir, stdout, stderr, duration);
        self.close_pipes(pipes, &run.stdout_pipe, &run.stderr_pipe);

        self.current_pid = None;
        self.update_next_run_time();
        self.save_state(state_dir);

        info!(
            "Job {} completed with status {:?}",
            self.config.name, self.status
        );
        self.status == JobStatus::Succeeded
    }

    fn close_pipes(
        &self,
        pipes: &PipeRegistry,
        stdout_pipe: &Option<String>,
        stderr_pipe: &Option<String>,
    ) {
        for pipe in [stdout_pipe, stderr_pipe].into_iter().flatten() {
            let _ = pipes.close(pipe);
        }
    }

    fn save_history(&self, history_dir: &Path, stdout: String, stderr: String, duration: f64) {
        let dir = Self::history_dir(history_dir, &self.config.name);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            error!("cannot create history dir for job {}: {err}", self.config.name);
            return;
        }
        let timestamp = self
            .last_run_time
            .unwrap_or_else(Local::now)
            .format("%Y%m%d_%H%M%S");
        let record = HistoryRecord {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            command: self.config.command.clone(),
            status: self.status,
            start_time: self
                .last_run_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            duration,
            exit_code: self.last_exit_code,
            stdout,
            stderr,
        };
        let path = dir.join(format!("{timestamp}.json"));
        if let Err(err) = persist::write_json_atomic(&path, &record) {
            error!("failed to save history for job {}: {err}", self.config.name);
        }
    }

    /// Most recent history records, newest first.
    pub fn history(&self, history_dir: &Path, limit: usize) -> Vec<HistoryRecord> {
        let dir = Self::history_dir(history_dir, &self.config.name);
        let mut names: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect(),
            Err(_) => return Vec::new(),
        };
        names.sort();
        names
            .into_iter()
            .rev()
            .take(limit)
            .filter_map(|path| persist::read_json(&path).ok())
            .collect()
    }
}

fn truncate(mut bytes: Vec<u8>) -> String {
    bytes.truncate(HISTORY_CAPTURE_CAP);
    String::from_utf8_lossy(&bytes).into_owned()
}
