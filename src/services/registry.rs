use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, trace, warn};

use super::service::{RestartPolicy, Service, ServiceConfig, ServiceState, ServiceStatus};
use crate::ipc::PipeRegistry;
use crate::process::{ProcessPriority, ProcessTable, SpawnRequest};
use crate::runtime_info::StopToken;

/// How long a stopping service gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Pause between stop and start on an explicit restart.
const RESTART_DELAY: Duration = Duration::from_millis(500);
/// Supervisor loop cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
/// A service that died this many times is considered beyond saving; the
/// supervisor stops restarting it and marks it FAILED.
const RESTART_LIMIT: u64 = 10;
/// Buffer size of the stdout/stderr/control pipes handed to services.
const SERVICE_PIPE_SIZE: u32 = 4096;

#[derive(Debug)]
pub enum ServiceError {
    NotFound(String),
    AlreadyExists(String),
    MissingDependency(String, String),
    DependencyFailed(String, String),
    DependencyCycle(String),
    ConflictRunning(String, String),
    SpawnFailed(String, String),
    NotRunning(String),
    Io(String, std::io::Error),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(name) => write!(fmt, "service {name} does not exist"),
            Self::AlreadyExists(name) => write!(fmt, "service {name} already exists"),
            Self::MissingDependency(name, dep) => {
                write!(fmt, "dependency {dep} of service {name} does not exist")
            }
            Self::DependencyFailed(name, dep) => {
                write!(fmt, "dependency {dep} of service {name} failed to start")
            }
            Self::DependencyCycle(name) => {
                write!(fmt, "dependency cycle detected while starting {name}")
            }
            Self::ConflictRunning(name, conflict) => {
                write!(fmt, "conflicting service {conflict} is running, cannot start {name}")
            }
            Self::SpawnFailed(name, reason) => {
                write!(fmt, "failed to spawn process for service {name}: {reason}")
            }
            Self::NotRunning(name) => write!(fmt, "service {name} is not running"),
            Self::Io(name, err) => write!(fmt, "io error for service {name}: {err}"),
        }
    }
}

/// Owner of every service. All state transitions are serialized by the
/// registry lock; dependency resolution is recursive depth-first with an
/// explicit visiting set for cycle detection.
pub struct ServiceRegistry {
    config_dir: PathBuf,
    state_dir: PathBuf,
    services: Mutex<HashMap<String, Service>>,
    processes: Arc<ProcessTable>,
    pipes: Arc<PipeRegistry>,
    environment: Arc<Mutex<HashMap<String, String>>>,
}

impl ServiceRegistry {
    pub fn new(
        config_dir: PathBuf,
        state_dir: PathBuf,
        processes: Arc<ProcessTable>,
        pipes: Arc<PipeRegistry>,
        environment: Arc<Mutex<HashMap<String, String>>>,
    ) -> Self {
        Self {
            config_dir,
            state_dir,
            services: Mutex::new(HashMap::new()),
            processes,
            pipes,
            environment,
        }
    }

    /// Load every persisted service config from disk. Called once at init.
    pub fn load_all(&self) {
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!("cannot list service config dir: {err}");
                return;
            }
        };
        let mut services = self.services.lock().unwrap();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e != "service").unwrap_or(true) {
                continue;
            }
            match Service::load(&path, &self.state_dir) {
                Ok(service) => {
                    info!("Loaded service {}", service.config.name);
                    services.insert(service.config.name.clone(), service);
                }
                Err(err) => error!("failed to load service from {}: {err}", path.display()),
            }
        }
        info!("Loaded {} services", services.len());
    }

    /// Register a new service. The `id` field of `config` is assigned here.
    pub fn create(&self, mut config: ServiceConfig) -> Result<String, ServiceError> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&config.name) {
            return Err(ServiceError::AlreadyExists(config.name));
        }
        config.id = uuid::Uuid::new_v4().to_string();
        let service = Service::new(config);
        service
            .save_config(&self.config_dir)
            .map_err(|err| ServiceError::Io(service.config.name.clone(), err))?;
        service.save_state(&self.state_dir);
        let id = service.config.id.clone();
        info!("Created service {}", service.config.name);
        services.insert(service.config.name.clone(), service);
        Ok(id)
    }

    /// Stop (if needed) and remove a service together with its files.
    pub fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().unwrap();
        if !services.contains_key(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        if matches!(
            state_of(&services, name),
            Some(ServiceState::Running) | Some(ServiceState::Starting)
        ) {
            let mut visiting = HashSet::new();
            if let Err(err) = self.stop_inner(&mut services, name, &mut visiting) {
                warn!("stopping {name} before deletion failed: {err}");
            }
        }
        services.remove(name);
        let _ = std::fs::remove_file(Service::config_path(&self.config_dir, name));
        let _ = std::fs::remove_file(Service::state_path(&self.state_dir, name));
        info!("Deleted service {name}");
        Ok(())
    }

    pub fn start(&self, name: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().unwrap();
        let mut visiting = HashSet::new();
        self.start_inner(&mut services, name, &mut visiting)
    }

    pub fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().unwrap();
        let mut visiting = HashSet::new();
        self.stop_inner(&mut services, name, &mut visiting)
    }

    /// Stop (when running), wait half a second, start again.
    pub fn restart(&self, name: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().unwrap();
        if !services.contains_key(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        if state_of(&services, name) == Some(ServiceState::Running) {
            let mut visiting = HashSet::new();
            self.stop_inner(&mut services, name, &mut visiting)?;
        }
        std::thread::sleep(RESTART_DELAY);
        if let Some(service) = services.get_mut(name) {
            service.runtime.restart_count += 1;
        }
        let mut visiting = HashSet::new();
        self.start_inner(&mut services, name, &mut visiting)
    }

    /// Send SIGHUP to a running service so it rereads its configuration.
    pub fn reload(&self, name: &str) -> Result<(), ServiceError> {
        let mut services = self.services.lock().unwrap();
        let pid = {
            let service = services
                .get(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            if service.runtime.state != ServiceState::Running {
                return Err(ServiceError::NotRunning(name.to_string()));
            }
            service.runtime.pid
        };
        self.set_state(&mut services, name, ServiceState::Reloading);
        if let Some(pid) = pid {
            if let Err(err) = self
                .processes
                .send_host_signal(pid, nix::sys::signal::Signal::SIGHUP)
            {
                warn!("reload signal for {name} failed: {err}");
            }
        }
        self.set_state(&mut services, name, ServiceState::Running);
        info!("Reloaded service {name}");
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let mut services = self.services.lock().unwrap();
        self.refresh_metrics(&mut services, name);
        services
            .get(name)
            .map(|s| s.status())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<ServiceStatus> {
        let services = self.services.lock().unwrap();
        let mut statuses: Vec<ServiceStatus> = services.values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn refresh_metrics(&self, services: &mut HashMap<String, Service>, name: &str) {
        if let Some(service) = services.get_mut(name) {
            if service.runtime.state == ServiceState::Running {
                if let Some(pid) = service.runtime.pid {
                    if let Ok(info) = self.processes.get_info(pid) {
                        service.runtime.cpu_usage = info.cpu_time;
                        service.runtime.memory_usage = info.memory_rss;
                    }
                }
            }
        }
    }

    fn set_state(&self, services: &mut HashMap<String, Service>, name: &str, state: ServiceState) {
        if let Some(service) = services.get_mut(name) {
            trace!("service {name}: {:?} -> {state:?}", service.runtime.state);
            service.runtime.state = state;
            service.save_state(&self.state_dir);
        }
    }

    fn fail(&self, services: &mut HashMap<String, Service>, name: &str, reason: String) {
        error!("service {name} failed: {reason}");
        if let Some(service) = services.get_mut(name) {
            service.runtime.state = ServiceState::Failed;
            service.runtime.failure_reason = Some(reason);
            service.save_state(&self.state_dir);
        }
    }

    fn close_pipes(&self, services: &mut HashMap<String, Service>, name: &str) {
        if let Some(service) = services.get_mut(name) {
            for pipe in [
                service.runtime.stdout_pipe.take(),
                service.runtime.stderr_pipe.take(),
                service.runtime.control_pipe.take(),
            ]
            .into_iter()
            .flatten()
            {
                if let Err(err) = self.pipes.close(&pipe) {
                    trace!("closing pipe {pipe} of service {name}: {err}");
                }
            }
        }
    }

    fn start_inner(
        &self,
        services: &mut HashMap<String, Service>,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> Result<(), ServiceError> {
        // The visiting set comes first: a service re-entered while it is
        // still ACTIVATING on this call stack is a dependency cycle.
        if !visiting.insert(name.to_string()) {
            self.fail(services, name, format!("dependency cycle through {name}"));
            return Err(ServiceError::DependencyCycle(name.to_string()));
        }
        let (dependencies, conflicts) = {
            let service = services
                .get(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            match service.runtime.state {
                ServiceState::Running | ServiceState::Starting | ServiceState::Reloading => {
                    debug!("service {name} is already running or starting");
                    return Ok(());
                }
                _ => {}
            }
            (
                service.config.dependencies.clone(),
                service.config.conflicts.clone(),
            )
        };

        info!("Starting service {name}");
        self.set_state(services, name, ServiceState::Activating);

        for dependency in &dependencies {
            if !services.contains_key(dependency) {
                self.fail(services, name, format!("dependency {dependency} not found"));
                return Err(ServiceError::MissingDependency(
                    name.to_string(),
                    dependency.clone(),
                ));
            }
            if state_of(services, dependency) != Some(ServiceState::Running) {
                debug!("starting dependency {dependency} for service {name}");
                if self.start_inner(services, dependency, visiting).is_err() {
                    self.fail(
                        services,
                        name,
                        format!("dependency {dependency} failed to start"),
                    );
                    return Err(ServiceError::DependencyFailed(
                        name.to_string(),
                        dependency.clone(),
                    ));
                }
            }
        }

        for conflict in &conflicts {
            if state_of(services, conflict) == Some(ServiceState::Running) {
                self.fail(
                    services,
                    name,
                    format!("conflicting service {conflict} is running"),
                );
                return Err(ServiceError::ConflictRunning(
                    name.to_string(),
                    conflict.clone(),
                ));
            }
        }

        let stdout_pipe = self
            .pipes
            .create(Some(format!("{name}_stdout")), SERVICE_PIPE_SIZE);
        let stderr_pipe = self
            .pipes
            .create(Some(format!("{name}_stderr")), SERVICE_PIPE_SIZE);
        let control_pipe = self
            .pipes
            .create(Some(format!("{name}_control")), SERVICE_PIPE_SIZE);
        let (stdout_pipe, stderr_pipe, control_pipe) =
            match (stdout_pipe, stderr_pipe, control_pipe) {
                (Ok(a), Ok(b), Ok(c)) => (a, b, c),
                _ => {
                    self.fail(services, name, "failed to create service pipes".to_string());
                    return Err(ServiceError::SpawnFailed(
                        name.to_string(),
                        "failed to create service pipes".to_string(),
                    ));
                }
            };

        self.set_state(services, name, ServiceState::Starting);

        let request = {
            let service = services
                .get(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            let mut environment = self.environment.lock().unwrap().clone();
            environment.extend(service.config.environment.clone());
            environment.insert("KOS_SERVICE_NAME".into(), service.config.name.clone());
            environment.insert("KOS_SERVICE_ID".into(), service.config.id.clone());
            environment.insert("KOS_STDOUT_PIPE".into(), stdout_pipe.clone());
            environment.insert("KOS_STDERR_PIPE".into(), stderr_pipe.clone());
            environment.insert("KOS_CONTROL_PIPE".into(), control_pipe.clone());
            SpawnRequest {
                name: service.config.name.clone(),
                command: service.config.exec_start.clone(),
                args: Vec::new(),
                environment,
                working_directory: service.config.working_directory.clone(),
                user: service.config.user.clone(),
                priority: ProcessPriority::Normal,
                parent_pid: None,
            }
        };

        match self.processes.spawn(request) {
            Ok(pid) => {
                let watchdog = services.get(name).and_then(|s| s.config.watchdog_sec);
                if let Some(service) = services.get_mut(name) {
                    service.runtime.state = ServiceState::Running;
                    service.runtime.pid = Some(pid);
                    service.runtime.start_time = Some(Utc::now());
                    service.runtime.stop_time = None;
                    service.runtime.failure_reason = None;
                    service.runtime.stdout_pipe = Some(stdout_pipe);
                    service.runtime.stderr_pipe = Some(stderr_pipe);
                    service.runtime.control_pipe = Some(control_pipe);
                    service.runtime.watchdog_deadline = watchdog
                        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
                    service.save_state(&self.state_dir);
                }
                visiting.remove(name);
                info!("Service {name} started with pid {pid}");
                Ok(())
            }
            Err(err) => {
                for pipe in [&stdout_pipe, &stderr_pipe, &control_pipe] {
                    let _ = self.pipes.close(pipe);
                }
                self.fail(services, name, err.to_string());
                Err(ServiceError::SpawnFailed(name.to_string(), err.to_string()))
            }
        }
    }

    fn stop_inner(
        &self,
        services: &mut HashMap<String, Service>,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> Result<(), ServiceError> {
        if !services.contains_key(name) {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        if !matches!(
            state_of(services, name),
            Some(ServiceState::Running) | Some(ServiceState::Starting)
        ) {
            debug!("service {name} is not running");
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Ok(());
        }

        info!("Stopping service {name}");
        self.set_state(services, name, ServiceState::Stopping);

        // Reverse dependencies go down first.
        let dependents: Vec<String> = services
            .iter()
            .filter(|(_, s)| {
                s.config.dependencies.iter().any(|d| d.as_str() == name)
                    && s.runtime.state == ServiceState::Running
            })
            .map(|(n, _)| n.clone())
            .collect();
        for dependent in dependents {
            debug!("stopping dependent service {dependent}");
            if let Err(err) = self.stop_inner(services, &dependent, visiting) {
                warn!("failed to stop dependent service {dependent}: {err}");
            }
        }

        let pid = services.get(name).and_then(|s| s.runtime.pid);
        if let Some(pid) = pid {
            if self.processes.process_exists(pid) {
                if let Err(err) = self.processes.terminate(pid, false) {
                    warn!("SIGTERM for service {name} failed: {err}");
                }
                let deadline = Instant::now() + STOP_GRACE;
                while self.processes.process_exists(pid) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(200));
                    self.processes.reap_once();
                }
                if self.processes.process_exists(pid) {
                    warn!("service {name} ignored SIGTERM, escalating to SIGKILL");
                    let _ = self.processes.terminate(pid, true);
                }
            }
        }

        self.close_pipes(services, name);
        if let Some(service) = services.get_mut(name) {
            service.runtime.last_exit_code = pid
                .and_then(|p| self.processes.get_info(p).ok())
                .and_then(|info| info.exit_code);
            service.runtime.last_exit_time = Some(Utc::now());
            service.runtime.state = ServiceState::Inactive;
            service.runtime.stop_time = Some(Utc::now());
            service.runtime.pid = None;
            service.runtime.watchdog_deadline = None;
            service.save_state(&self.state_dir);
        }
        info!("Service {name} stopped");
        Ok(())
    }

    /// One supervisor pass: reap-and-restart dead services, enforce
    /// watchdog deadlines. Errors are logged and swallowed so one broken
    /// service cannot take the loop down.
    pub fn monitor_once(&self) {
        let mut services = self.services.lock().unwrap();
        let names: Vec<String> = services.keys().cloned().collect();
        for name in names {
            let (state, pid, policy, control_pipe, deadline, watchdog_sec) = {
                let service = match services.get(&name) {
                    Some(service) => service,
                    None => continue,
                };
                (
                    service.runtime.state,
                    service.runtime.pid,
                    service.config.restart_policy,
                    service.runtime.control_pipe.clone(),
                    service.runtime.watchdog_deadline,
                    service.config.watchdog_sec,
                )
            };
            if state != ServiceState::Running {
                continue;
            }

            let process_gone = pid.map(|p| !self.processes.process_exists(p)).unwrap_or(true);
            if process_gone {
                warn!("service {name} process (pid {pid:?}) has terminated");
                let exit_code = pid
                    .and_then(|p| self.processes.get_info(p).ok())
                    .and_then(|info| info.exit_code);
                self.close_pipes(&mut services, &name);
                if let Some(service) = services.get_mut(&name) {
                    service.runtime.state = ServiceState::Inactive;
                    service.runtime.stop_time = Some(Utc::now());
                    service.runtime.last_exit_code = exit_code;
                    service.runtime.last_exit_time = Some(Utc::now());
                    service.runtime.pid = None;
                    service.save_state(&self.state_dir);
                }
                if matches!(policy, RestartPolicy::Always | RestartPolicy::OnFailure) {
                    let restart_count = services
                        .get(&name)
                        .map(|s| s.runtime.restart_count)
                        .unwrap_or(0);
                    if restart_count >= RESTART_LIMIT {
                        self.fail(
                            &mut services,
                            &name,
                            format!("giving up after {restart_count} restarts"),
                        );
                        continue;
                    }
                    info!("restarting service {name} per policy {policy:?}");
                    if let Some(service) = services.get_mut(&name) {
                        service.runtime.restart_count += 1;
                    }
                    let mut visiting = HashSet::new();
                    if let Err(err) = self.start_inner(&mut services, &name, &mut visiting) {
                        error!("restart of service {name} failed: {err}");
                    }
                }
                continue;
            }

            // Watchdog: the service refreshes its deadline by writing
            // WATCHDOG=1 into the control pipe.
            if let (Some(deadline), Some(watchdog_sec)) = (deadline, watchdog_sec) {
                let mut refreshed = false;
                if let Some(control) = &control_pipe {
                    if let Ok(data) = self.pipes.read(control, SERVICE_PIPE_SIZE as usize, true) {
                        if String::from_utf8_lossy(&data).contains("WATCHDOG=1") {
                            refreshed = true;
                        }
                    }
                }
                if refreshed {
                    if let Some(service) = services.get_mut(&name) {
                        service.runtime.watchdog_deadline =
                            Some(Instant::now() + Duration::from_secs_f64(watchdog_sec));
                    }
                } else if Instant::now() > deadline {
                    warn!("service {name} missed its watchdog deadline");
                    if let Some(pid) = pid {
                        let _ = self.processes.terminate(pid, true);
                    }
                    self.close_pipes(&mut services, &name);
                    self.fail(&mut services, &name, "watchdog timeout".to_string());
                    if let Some(service) = services.get_mut(&name) {
                        service.runtime.pid = None;
                        service.runtime.watchdog_deadline = None;
                    }
                    if matches!(policy, RestartPolicy::OnWatchdog | RestartPolicy::Always) {
                        info!("restarting service {name} after watchdog timeout");
                        if let Some(service) = services.get_mut(&name) {
                            service.runtime.restart_count += 1;
                        }
                        let mut visiting = HashSet::new();
                        if let Err(err) = self.start_inner(&mut services, &name, &mut visiting) {
                            error!("watchdog restart of service {name} failed: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Supervisor loop: 2 second cadence, stop token polled every second.
    pub fn run_monitor_loop(&self, stop: &StopToken) {
        info!("service monitor started");
        while !stop.sleep_slices(MONITOR_INTERVAL) {
            self.monitor_once();
        }
        info!("service monitor stopped");
    }

    /// Stop every running service. Used on shutdown.
    pub fn stop_all(&self) {
        let mut services = self.services.lock().unwrap();
        let names: Vec<String> = services.keys().cloned().collect();
        for name in names {
            if state_of(&services, &name) == Some(ServiceState::Running) {
                let mut visiting = HashSet::new();
                if let Err(err) = self.stop_inner(&mut services, &name, &mut visiting) {
                    warn!("failed to stop service {name} on shutdown: {err}");
                }
            }
        }
    }
}

fn state_of(services: &HashMap<String, Service>, name: &str) -> Option<ServiceState> {
    services.get(name).map(|s| s.runtime.state)
}
