use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Inactive,
    Activating,
    Starting,
    Running,
    Reloading,
    Stopping,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Simple,
    Forking,
    Oneshot,
    Notify,
    Idle,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    No,
    OnSuccess,
    OnFailure,
    OnAbnormal,
    OnWatchdog,
    OnAbort,
    Always,
}

/// The immutable configuration of a service, persisted as
/// `services/config/<name>.service`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub service_type: ServiceType,
    pub restart_policy: RestartPolicy,
    pub working_directory: Option<PathBuf>,
    pub user: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Seconds the service has to refresh the watchdog by writing
    /// `WATCHDOG=1` into its control pipe. `None` disables the watchdog.
    #[serde(default)]
    pub watchdog_sec: Option<f64>,
}

/// Mutable runtime state of a service. Only part of it is persisted; the
/// pipe ids and the watchdog deadline are per-run.
#[derive(Debug)]
pub struct ServiceRuntime {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub restart_count: u64,
    pub last_exit_code: Option<i32>,
    pub last_exit_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub io_read: u64,
    pub io_write: u64,
    pub stdout_pipe: Option<String>,
    pub stderr_pipe: Option<String>,
    pub control_pipe: Option<String>,
    pub watchdog_deadline: Option<Instant>,
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self {
            state: ServiceState::Inactive,
            pid: None,
            start_time: None,
            stop_time: None,
            restart_count: 0,
            last_exit_code: None,
            last_exit_time: None,
            failure_reason: None,
            cpu_usage: 0.0,
            memory_usage: 0,
            io_read: 0,
            io_write: 0,
            stdout_pipe: None,
            stderr_pipe: None,
            control_pipe: None,
            watchdog_deadline: None,
        }
    }
}

/// On-disk shape of `services/state/<name>.state`.
#[derive(Serialize, Deserialize)]
struct ServiceStateFile {
    id: String,
    name: String,
    state: ServiceState,
    pid: Option<u32>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    restart_count: u64,
    last_exit_code: Option<i32>,
    last_exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    failure_reason: Option<String>,
    cpu_usage: f64,
    memory_usage: u64,
    io_read: u64,
    io_write: u64,
}

/// Status snapshot handed to callers.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: ServiceState,
    pub service_type: ServiceType,
    pub restart_policy: RestartPolicy,
    pub pid: Option<u32>,
    pub uptime: Option<f64>,
    pub restart_count: u64,
    pub last_exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub dependencies: Vec<String>,
    pub conflicts: Vec<String>,
    pub cpu_usage: f64,
    pub memory_usage: u64,
}

pub struct Service {
    pub config: ServiceConfig,
    pub runtime: ServiceRuntime,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            runtime: ServiceRuntime::default(),
        }
    }

    pub fn config_path(config_dir: &Path, name: &str) -> PathBuf {
        config_dir.join(format!("{name}.service"))
    }

    pub fn state_path(state_dir: &Path, name: &str) -> PathBuf {
        state_dir.join(format!("{name}.state"))
    }

    pub fn save_config(&self, config_dir: &Path) -> std::io::Result<()> {
        persist::write_json_atomic(&Self::config_path(config_dir, &self.config.name), &self.config)
    }

    /// Rewrite the state file. Persistence failures are logged, not
    /// propagated; the in-memory state machine stays authoritative.
    pub fn save_state(&self, state_dir: &Path) {
        let state = ServiceStateFile {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            state: self.runtime.state,
            pid: self.runtime.pid,
            start_time: self.runtime.start_time,
            stop_time: self.runtime.stop_time,
            restart_count: self.runtime.restart_count,
            last_exit_code: self.runtime.last_exit_code,
            last_exit_time: self.runtime.last_exit_time,
            failure_reason: self.runtime.failure_reason.clone(),
            cpu_usage: self.runtime.cpu_usage,
            memory_usage: self.runtime.memory_usage,
            io_read: self.runtime.io_read,
            io_write: self.runtime.io_write,
        };
        let path = Self::state_path(state_dir, &self.config.name);
        if let Err(err) = persist::write_json_atomic(&path, &state) {
            error!("failed to save state for service {}: {err}", self.config.name);
        }
    }

    /// Reconstruct a service from its config file, folding in persisted
    /// state when present. A service that was RUNNING when the previous
    /// instance died comes back INACTIVE; the old pid is meaningless now.
    pub fn load(config_path: &Path, state_dir: &Path) -> std::io::Result<Self> {
        let config: ServiceConfig = persist::read_json(config_path)?;
        let mut service = Self::new(config);
        let state_path = Self::state_path(state_dir, &service.config.name);
        if state_path.exists() {
            match persist::read_json::<ServiceStateFile>(&state_path) {
                Ok(state) => {
                    service.runtime.restart_count = state.restart_count;
                    service.runtime.last_exit_code = state.last_exit_code;
                    service.runtime.last_exit_time = state.last_exit_time;
                    service.runtime.stop_time = state.stop_time;
                    service.runtime.failure_reason = state.failure_reason;
                    service.runtime.state = match state.state {
                        ServiceState::Failed => ServiceState::Failed,
                        _ => ServiceState::Inactive,
                    };
                }
                Err(err) => {
                    error!(
                        "refusing corrupt state file for service {}: {err}",
                        service.config.name
                    );
                }
            }
        }
        Ok(service)
    }

    pub fn status(&self) -> ServiceStatus {
        let uptime = match (self.runtime.state, self.runtime.start_time) {
            (ServiceState::Running, Some(started)) => {
                Some((Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        ServiceStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            state: self.runtime.state,
            service_type: self.config.service_type,
            restart_policy: self.config.restart_policy,
            pid: self.runtime.pid,
            uptime,
            restart_count: self.runtime.restart_count,
            last_exit_code: self.runtime.last_exit_code,
            failure_reason: self.runtime.failure_reason.clone(),
            dependencies: self.config.dependencies.clone(),
            conflicts: self.config.conflicts.clone(),
            cpu_usage: self.runtime.cpu_usage,
            memory_usage: self.runtime.memory_usage,
        }
    }
}
