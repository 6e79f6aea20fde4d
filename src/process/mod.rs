//! Process table: tracks every child kosd spawns on behalf of services,
//! scheduler jobs and syscall clients.
//!
//! Table entries are keyed by virtual pids starting at 1000; host pids
//! never cross a syscall boundary. Children run with piped stdio and a
//! drain thread per stream so a chatty child can never block on a full
//! pipe; capture is capped at 1 MiB per stream. A single loop thread reaps
//! exited children and runs the advisory priority scheduler every 100 ms.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::ipc::now_epoch;
use crate::runtime_info::StopToken;

pub const FIRST_PID: u32 = 1000;
/// Captured output cap per stream. Draining continues past the cap so the
/// child never stalls; the excess is discarded.
pub const OUTPUT_CAP: usize = 1024 * 1024;

const LOOP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Terminated,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessPriority {
    Idle,
    Low,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

impl ProcessPriority {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Low),
            2 => Some(Self::BelowNormal),
            3 => Some(Self::Normal),
            4 => Some(Self::AboveNormal),
            5 => Some(Self::High),
            6 => Some(Self::Realtime),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SpawnError {
    EmptyCommand,
    CommandNotFound(String),
    UnknownUser(String),
    WorkingDirectory(String),
    Spawn(String, std::io::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EmptyCommand => write!(fmt, "empty command line"),
            Self::CommandNotFound(cmd) => write!(fmt, "command not found: {cmd}"),
            Self::UnknownUser(user) => write!(fmt, "unknown user: {user}"),
            Self::WorkingDirectory(dir) => {
                write!(fmt, "working directory does not exist: {dir}")
            }
            Self::Spawn(cmd, err) => write!(fmt, "failed to spawn {cmd}: {err}"),
        }
    }
}

#[derive(Debug)]
pub enum ProcessError {
    NotFound(u32),
    Timeout(u32),
    Signal(nix::errno::Errno),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(pid) => write!(fmt, "no such process: {pid}"),
            Self::Timeout(pid) => write!(fmt, "timed out waiting for process {pid}"),
            Self::Signal(errno) => write!(fmt, "signal delivery failed: {errno}"),
        }
    }
}

pub struct SpawnRequest {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Fully merged environment for the child; the caller does the merging.
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub user: Option<String>,
    pub priority: ProcessPriority,
    pub parent_pid: Option<u32>,
}

/// Snapshot of a table entry, shaped for the syscall boundary.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub priority: ProcessPriority,
    pub parent_pid: Option<u32>,
    pub children: Vec<u32>,
    pub host_pid: Option<u32>,
    pub creation_time: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub exit_code: Option<i32>,
    pub memory_rss: u64,
    pub cpu_time: f64,
}

pub type ProcessCallback = Arc<dyn Fn(u32, ProcessState) + Send + Sync>;

struct ProcessEntry {
    pid: u32,
    name: String,
    command: String,
    args: Vec<String>,
    state: ProcessState,
    priority: ProcessPriority,
    parent_pid: Option<u32>,
    children: BTreeSet<u32>,
    creation_time: f64,
    start_time: Option<f64>,
    end_time: Option<f64>,
    exit_code: Option<i32>,
    host_pid: Option<u32>,
    child: Option<Child>,
    stdout_buf: Arc<Mutex<Vec<u8>>>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    drains: Vec<std::thread::JoinHandle<()>>,
    suspended: bool,
}

struct TableInner {
    entries: HashMap<u32, ProcessEntry>,
    next_pid: u32,
    current: Option<u32>,
}

#[derive(Default)]
struct Callbacks {
    per_pid: HashMap<u32, Vec<ProcessCallback>>,
    wildcard: Vec<ProcessCallback>,
}

pub struct ProcessTable {
    inner: Mutex<TableInner>,
    callbacks: Mutex<Callbacks>,
    /// Invoked with the virtual pid after an entry reaches TERMINATED.
    /// The runtime hooks signal-table cleanup in here.
    exit_hooks: Mutex<Vec<Box<dyn Fn(u32) + Send + Sync>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_pid: FIRST_PID,
                current: None,
            }),
            callbacks: Mutex::new(Callbacks::default()),
            exit_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a host child for `req` and track it. The fork happens under
    /// the table lock so a fast exit cannot race the entry insertion.
    pub fn spawn(&self, req: SpawnRequest) -> Result<u32, SpawnError> {
        let mut argv = if req.args.is_empty() {
            shlex::split(&req.command).ok_or(SpawnError::EmptyCommand)?
        } else {
            let mut argv = vec![req.command.clone()];
            argv.extend(req.args.iter().cloned());
            argv
        };
        if argv.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }
        let program = argv.remove(0);
        let resolved = if program.contains('/') {
            let path = PathBuf::from(&program);
            if path.exists() {
                path
            } else {
                return Err(SpawnError::CommandNotFound(program));
            }
        } else {
            which::which(&program).map_err(|_| SpawnError::CommandNotFound(program.clone()))?
        };
        if let Some(dir) = &req.working_directory {
            if !dir.is_dir() {
                return Err(SpawnError::WorkingDirectory(dir.display().to_string()));
            }
        }

        let mut cmd = Command::new(&resolved);
        cmd.args(&argv)
            .env_clear()
            .envs(&req.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &req.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(user) = &req.user {
            let account = nix::unistd::User::from_name(user)
                .ok()
                .flatten()
                .ok_or_else(|| SpawnError::UnknownUser(user.clone()))?;
            use std::os::unix::process::CommandExt;
            cmd.uid(account.uid.as_raw());
            cmd.gid(account.gid.as_raw());
        }

        let pid;
        {
            let mut inner = self.inner.lock().unwrap();
            let mut child = cmd
                .spawn()
                .map_err(|err| SpawnError::Spawn(req.command.clone(), err))?;
            let host_pid = child.id();

            let stdout_buf = Arc::new(Mutex::new(Vec::new()));
            let stderr_buf = Arc::new(Mutex::new(Vec::new()));
            let mut drains = Vec::new();
            if let Some(stream) = child.stdout.take() {
                drains.push(spawn_drain(stream, stdout_buf.clone()));
            }
            if let Some(stream) = child.stderr.take() {
                drains.push(spawn_drain(stream, stderr_buf.clone()));
            }

            pid = inner.next_pid;
            inner.next_pid += 1;
            if let Some(parent) = req.parent_pid {
                if let Some(parent_entry) = inner.entries.get_mut(&parent) {
                    parent_entry.children.insert(pid);
                }
            }
            let now = now_epoch();
            inner.entries.insert(
                pid,
                ProcessEntry {
                    pid,
                    name: req.name,
                    command: req.command,
                    args: argv,
                    state: ProcessState::Ready,
                    priority: req.priority,
                    parent_pid: req.parent_pid,
                    children: BTreeSet::new(),
                    creation_time: now,
                    start_time: Some(now),
                    end_time: None,
                    exit_code: None,
                    host_pid: Some(host_pid),
                    child: Some(child),
                    stdout_buf,
                    stderr_buf,
                    drains,
                    suspended: false,
                },
            );
            debug!("Spawned process {pid} (host pid {host_pid})");
        }
        self.notify(&[(pid, ProcessState::Ready)]);
        Ok(pid)
    }

    fn notify(&self, transitions: &[(u32, ProcessState)]) {
        if transitions.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock().unwrap();
        for (pid, state) in transitions {
            if let Some(list) = callbacks.per_pid.get(pid) {
                for callback in list {
                    callback(*pid, *state);
                }
            }
            for callback in &callbacks.wildcard {
                callback(*pid, *state);
            }
        }
    }

    /// Register a state-change callback; `pid` of `None` means wildcard.
    pub fn register_callback(&self, pid: Option<u32>, callback: ProcessCallback) {
        let mut callbacks = self.callbacks.lock().unwrap();
        match pid {
            Some(pid) => callbacks.per_pid.entry(pid).or_default().push(callback),
            None => callbacks.wildcard.push(callback),
        }
    }

    pub fn register_exit_hook(&self, hook: Box<dyn Fn(u32) + Send + Sync>) {
        self.exit_hooks.lock().unwrap().push(hook);
    }

    /// True while the entry exists and has not terminated.
    pub fn process_exists(&self, pid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&pid)
            .map(|e| e.state != ProcessState::Terminated)
            .unwrap_or(false)
    }

    pub fn host_pid_of(&self, pid: u32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&pid).and_then(|e| e.host_pid)
    }

    /// Deliver a host signal to the child behind a virtual pid.
    pub fn send_host_signal(
        &self,
        pid: u32,
        signal: nix::sys::signal::Signal,
    ) -> Result<(), ProcessError> {
        let host_pid = {
            let inner = self.inner.lock().unwrap();
            match inner.entries.get(&pid) {
                Some(entry) if entry.state != ProcessState::Terminated => entry.host_pid,
                _ => return Err(ProcessError::NotFound(pid)),
            }
        };
        let host_pid = host_pid.ok_or(ProcessError::NotFound(pid))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(host_pid as i32), signal)
            .map_err(ProcessError::Signal)
    }

    pub fn terminate(&self, pid: u32, force: bool) -> Result<(), ProcessError> {
        let signal = if force {
            nix::sys::signal::Signal::SIGKILL
        } else {
            nix::sys::signal::Signal::SIGTERM
        };
        debug!("Terminating process {pid} with {signal:?}");
        self.send_host_signal(pid, signal)
    }

    pub fn suspend(&self, pid: u32) -> Result<(), ProcessError> {
        self.send_host_signal(pid, nix::sys::signal::Signal::SIGSTOP)?;
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .entries
                .get_mut(&pid)
                .ok_or(ProcessError::NotFound(pid))?;
            entry.suspended = true;
            entry.state = ProcessState::Waiting;
            (pid, ProcessState::Waiting)
        };
        self.notify(&[transition]);
        Ok(())
    }

    pub fn resume(&self, pid: u32) -> Result<(), ProcessError> {
        self.send_host_signal(pid, nix::sys::signal::Signal::SIGCONT)?;
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .entries
                .get_mut(&pid)
                .ok_or(ProcessError::NotFound(pid))?;
            entry.suspended = false;
            entry.state = ProcessState::Ready;
            (pid, ProcessState::Ready)
        };
        self.notify(&[transition]);
        Ok(())
    }

    pub fn set_priority(&self, pid: u32, priority: ProcessPriority) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&pid)
            .ok_or(ProcessError::NotFound(pid))?;
        entry.priority = priority;
        Ok(())
    }

    /// Wait for a process to terminate, bounded by the caller's timeout.
    /// Returns the exit code (negative signal number for signal deaths).
    /// Polls with exponential backoff so fast children get low latency
    /// without hogging a core.
    pub fn wait(&self, pid: u32, timeout: Option<Duration>) -> Result<i32, ProcessError> {
        let started = Instant::now();
        let mut backoff = 1u64;
        loop {
            self.reap_once();
            {
                let inner = self.inner.lock().unwrap();
                let entry = inner.entries.get(&pid).ok_or(ProcessError::NotFound(pid))?;
                if entry.state == ProcessState::Terminated {
                    return Ok(entry.exit_code.unwrap_or(-1));
                }
            }
            if let Some(budget) = timeout {
                if started.elapsed() >= budget {
                    return Err(ProcessError::Timeout(pid));
                }
            }
            // backoff starts at 50 microseconds and is capped at 10 ms
            let sleep_cap = Duration::from_millis(10);
            let sleep_dur = Duration::from_micros(backoff * 50).min(sleep_cap);
            if sleep_dur < sleep_cap {
                backoff *= 2;
            }
            std::thread::sleep(sleep_dur);
        }
    }

    pub fn get_info(&self, pid: u32) -> Result<ProcessInfo, ProcessError> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&pid)
            .map(entry_info)
            .ok_or(ProcessError::NotFound(pid))
    }

    pub fn list_infos(&self) -> Vec<ProcessInfo> {
        let inner = self.inner.lock().unwrap();
        let mut infos: Vec<ProcessInfo> = inner.entries.values().map(entry_info).collect();
        infos.sort_by_key(|info| info.pid);
        infos
    }

    pub fn children_of(&self, pid: u32) -> Result<Vec<u32>, ProcessError> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&pid)
            .map(|e| e.children.iter().copied().collect())
            .ok_or(ProcessError::NotFound(pid))
    }

    /// Snapshot of the captured stdout/stderr for a process.
    pub fn captured_output(&self, pid: u32) -> Result<(Vec<u8>, Vec<u8>), ProcessError> {
        let (stdout_buf, stderr_buf) = {
            let inner = self.inner.lock().unwrap();
            let entry = inner.entries.get(&pid).ok_or(ProcessError::NotFound(pid))?;
            (entry.stdout_buf.clone(), entry.stderr_buf.clone())
        };
        let stdout = stdout_buf.lock().unwrap().clone();
        let stderr = stderr_buf.lock().unwrap().clone();
        Ok((stdout, stderr))
    }

    /// Counts of live (non-terminated) and total entries.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let live = inner
            .entries
            .values()
            .filter(|e| e.state != ProcessState::Terminated)
            .count();
        (live, inner.entries.len())
    }

    /// One reap pass: collect exit status of any child that has finished.
    /// Drain threads are joined here, so a TERMINATED entry always has its
    /// captured output complete.
    pub fn reap_once(&self) {
        let mut transitions = Vec::new();
        let mut exited = Vec::new();
        let mut drains = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for entry in inner.entries.values_mut() {
                let finished = match entry.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            use std::os::unix::process::ExitStatusExt;
                            let code = status
                                .code()
                                .unwrap_or_else(|| -status.signal().unwrap_or(0));
                            entry.exit_code = Some(code);
                            true
                        }
                        Ok(None) => false,
                        Err(err) => {
                            warn!("failed to poll process {}: {err}", entry.pid);
                            false
                        }
                    },
                    None => false,
                };
                if finished {
                    entry.child = None;
                    entry.end_time = Some(now_epoch());
                    entry.state = ProcessState::Terminated;
                    transitions.push((entry.pid, ProcessState::Terminated));
                    exited.push(entry.pid);
                    drains.append(&mut entry.drains);
                    debug!(
                        "Process {} terminated with exit code {:?}",
                        entry.pid, entry.exit_code
                    );
                }
            }
            if let Some(current) = inner.current {
                if exited.contains(&current) {
                    inner.current = None;
                }
            }
        }
        // the dead child's pipes hit EOF immediately, so these joins are
        // short and the buffers are final afterwards
        for drain in drains {
            let _ = drain.join();
        }
        self.notify(&transitions);
        if !exited.is_empty() {
            let hooks = self.exit_hooks.lock().unwrap();
            for pid in &exited {
                for hook in hooks.iter() {
                    hook(*pid);
                }
            }
        }
    }

    /// Advisory scheduling pass: mark the highest-priority READY entry as
    /// RUNNING. The host kernel still does the real scheduling; this only
    /// orders the table's own view.
    fn schedule_once(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let best = inner
                .entries
                .values()
                .filter(|e| e.state == ProcessState::Ready && !e.suspended)
                .max_by_key(|e| (e.priority, std::cmp::Reverse(e.pid)))
                .map(|e| e.pid);
            let best = match best {
                Some(pid) => pid,
                None => return,
            };
            if inner.current == Some(best) {
                return;
            }
            if let Some(previous) = inner.current {
                if let Some(entry) = inner.entries.get_mut(&previous) {
                    if entry.state == ProcessState::Running {
                        entry.state = ProcessState::Ready;
                        transitions.push((previous, ProcessState::Ready));
                    }
                }
            }
            if let Some(entry) = inner.entries.get_mut(&best) {
                entry.state = ProcessState::Running;
                transitions.push((best, ProcessState::Running));
            }
            inner.current = Some(best);
        }
        self.notify(&transitions);
    }

    /// Reap + schedule every 100 ms until the stop token fires.
    pub fn run_loop(&self, stop: &StopToken) {
        trace!("process table loop started");
        while !stop.is_stopped() {
            self.reap_once();
            self.schedule_once();
            std::thread::sleep(LOOP_INTERVAL);
        }
        trace!("process table loop stopped");
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_info(entry: &ProcessEntry) -> ProcessInfo {
    let (memory_rss, cpu_time) = entry
        .host_pid
        .filter(|_| entry.state != ProcessState::Terminated)
        .map(host_metrics)
        .unwrap_or((0, 0.0));
    ProcessInfo {
        pid: entry.pid,
        name: entry.name.clone(),
        command: entry.command.clone(),
        args: entry.args.clone(),
        state: entry.state,
        priority: entry.priority,
        parent_pid: entry.parent_pid,
        children: entry.children.iter().copied().collect(),
        host_pid: entry.host_pid,
        creation_time: entry.creation_time,
        start_time: entry.start_time,
        end_time: entry.end_time,
        exit_code: entry.exit_code,
        memory_rss,
        cpu_time,
    }
}

/// Resident set size in bytes and accumulated cpu seconds, best effort.
#[cfg(target_os = "linux")]
fn host_metrics(host_pid: u32) -> (u64, f64) {
    let rss = std::fs::read_to_string(format!("/proc/{host_pid}/statm"))
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0);
    let ticks_per_sec = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        ticks if ticks > 0 => ticks as f64,
        _ => 100.0,
    };
    let cpu = std::fs::read_to_string(format!("/proc/{host_pid}/stat"))
        .ok()
        .and_then(|s| {
            // fields 14 and 15 are utime/stime in clock ticks; the comm
            // field may contain spaces, so count from the closing paren
            let tail = s.rsplit(')').next()?.to_string();
            let fields: Vec<&str> = tail.split_whitespace().collect();
            let utime: u64 = fields.get(11)?.parse().ok()?;
            let stime: u64 = fields.get(12)?.parse().ok()?;
            Some((utime + stime) as f64 / ticks_per_sec)
        })
        .unwrap_or(0.0);
    (rss, cpu)
}

#[cfg(not(target_os = "linux"))]
fn host_metrics(_host_pid: u32) -> (u64, f64) {
    (0, 0.0)
}

fn spawn_drain(
    mut stream: impl Read + Send + 'static,
    buf: Arc<Mutex<Vec<u8>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buf = buf.lock().unwrap();
                    if buf.len() < OUTPUT_CAP {
                        let take = n.min(OUTPUT_CAP - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                    }
                }
            }
        }
    })
}

