//! Per-process signal handler registry.
//!
//! Signals here are a user-space construct keyed by virtual pids. The
//! classic termination signals (SIGKILL, SIGTERM, SIGINT) are forwarded to
//! the host child behind the pid; everything else is delivered to handlers
//! registered in this table. Handlers run on a small worker pool so a slow
//! handler never blocks the sender. SIGKILL and SIGTERM can never be
//! blocked.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, error, trace, warn};
use threadpool::ThreadPool;

use crate::process::ProcessTable;

/// Signal numbers as exposed through the syscall interface. The POSIX
/// range matches the host; numbers from 64 up are KOS events.
pub mod signum {
    pub const SIGHUP: i32 = 1;
    pub const SIGINT: i32 = 2;
    pub const SIGQUIT: i32 = 3;
    pub const SIGABRT: i32 = 6;
    pub const SIGKILL: i32 = 9;
    pub const SIGUSR1: i32 = 10;
    pub const SIGUSR2: i32 = 12;
    pub const SIGPIPE: i32 = 13;
    pub const SIGALRM: i32 = 14;
    pub const SIGTERM: i32 = 15;

    /// Process state change
    pub const SIGPROC: i32 = 64;
    /// Memory threshold reached
    pub const SIGMEM: i32 = 65;
    /// Filesystem event
    pub const SIGFS: i32 = 66;
    /// Network event
    pub const SIGNET: i32 = 67;
    /// IPC event
    pub const SIGIPC: i32 = 68;
    /// System event
    pub const SIGSYS: i32 = 69;
    /// Task completed
    pub const SIGTASK: i32 = 70;
    /// Custom user event
    pub const SIGUSER: i32 = 71;
}

pub type SignalHandler = Arc<dyn Fn(i32, Option<serde_json::Value>) + Send + Sync>;

#[derive(Debug)]
pub enum SignalError {
    NoSuchProcess(u32),
    Delivery(String),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NoSuchProcess(pid) => write!(fmt, "no such process: {pid}"),
            Self::Delivery(msg) => write!(fmt, "signal delivery failed: {msg}"),
        }
    }
}

#[derive(Default)]
struct ProcessSignals {
    handlers: HashMap<i32, SignalHandler>,
    blocked: HashSet<i32>,
    pending: HashMap<i32, u32>,
}

pub struct SignalTable {
    entries: Mutex<HashMap<u32, ProcessSignals>>,
    workers: ThreadPool,
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            workers: ThreadPool::new(4),
        }
    }

    /// Register (or with `None`, reset) a handler. Returns the previous one.
    pub fn register_handler(
        &self,
        pid: u32,
        signal: i32,
        handler: Option<SignalHandler>,
    ) -> Option<SignalHandler> {
        let mut entries = self.entries.lock().unwrap();
        let signals = entries.entry(pid).or_default();
        match handler {
            Some(handler) => signals.handlers.insert(signal, handler),
            None => signals.handlers.remove(&signal),
        }
    }

    /// Block a signal for a process. SIGKILL and SIGTERM are never masked;
    /// blocking them is refused.
    pub fn block(&self, pid: u32, signal: i32) -> bool {
        if signal == signum::SIGKILL || signal == signum::SIGTERM {
            warn!("refusing to block signal {signal} for process {pid}");
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.entry(pid).or_default().blocked.insert(signal);
        true
    }

    /// Unblock a signal and drain its pending count, invoking the handler
    /// once per pending unit.
    pub fn unblock(&self, pid: u32, signal: i32) {
        let (handler, pending) = {
            let mut entries = self.entries.lock().unwrap();
            let signals = entries.entry(pid).or_default();
            signals.blocked.remove(&signal);
            let pending = signals.pending.remove(&signal).unwrap_or(0);
            (signals.handlers.get(&signal).cloned(), pending)
        };
        if pending > 0 {
            trace!("draining {pending} pending unit(s) of signal {signal} for process {pid}");
        }
        if let Some(handler) = handler {
            for _ in 0..pending {
                self.run_handler(pid, signal, handler.clone(), None);
            }
        }
    }

    fn run_handler(
        &self,
        pid: u32,
        signal: i32,
        handler: SignalHandler,
        data: Option<serde_json::Value>,
    ) {
        self.workers.execute(move || {
            // handler panics must not take the pool down with them
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(signal, data);
            }));
            if result.is_err() {
                error!("signal handler for process {pid}, signal {signal} panicked");
            }
        });
    }

    /// Deliver a signal. Termination signals go to the host; a blocked
    /// signal accumulates a pending count; an unhandled SIGKILL/SIGTERM
    /// falls back to terminating the process through the table.
    pub fn send(
        &self,
        processes: &ProcessTable,
        pid: u32,
        signal: i32,
        data: Option<serde_json::Value>,
    ) -> Result<(), SignalError> {
        if !processes.process_exists(pid) {
            return Err(SignalError::NoSuchProcess(pid));
        }

        if matches!(signal, signum::SIGKILL | signum::SIGTERM | signum::SIGINT) {
            let host_signal = match signal {
                signum::SIGKILL => nix::sys::signal::Signal::SIGKILL,
                signum::SIGINT => nix::sys::signal::Signal::SIGINT,
                _ => nix::sys::signal::Signal::SIGTERM,
            };
            return processes
                .send_host_signal(pid, host_signal)
                .map_err(|e| SignalError::Delivery(e.to_string()));
        }

        let handler = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&pid) {
                Some(signals) => {
                    if signals.blocked.contains(&signal) {
                        *signals.pending.entry(signal).or_insert(0) += 1;
                        trace!("signal {signal} for process {pid} blocked, now pending");
                        return Ok(());
                    }
                    signals.handlers.get(&signal).cloned()
                }
                None => {
                    debug!("no signal table entry for process {pid}, dropping signal {signal}");
                    return Ok(());
                }
            }
        };

        if let Some(handler) = handler {
            self.run_handler(pid, signal, handler, data);
        }
        Ok(())
    }

    /// Invoke handlers for pending, unblocked signals: one pending unit per
    /// signal number per call. Returns the number processed.
    pub fn process_pending(&self, pid: u32) -> usize {
        let mut to_run = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let signals = match entries.get_mut(&pid) {
                Some(signals) => signals,
                None => return 0,
            };
            let pending: Vec<i32> = signals.pending.keys().copied().collect();
            for signal in pending {
                if signals.blocked.contains(&signal) {
                    continue;
                }
                if let Some(handler) = signals.handlers.get(&signal).cloned() {
                    to_run.push((signal, handler));
                }
                match signals.pending.get_mut(&signal) {
                    Some(count) if *count > 1 => *count -= 1,
                    _ => {
                        signals.pending.remove(&signal);
                    }
                }
            }
        }
        let count = to_run.len();
        for (signal, handler) in to_run {
            self.run_handler(pid, signal, handler, None);
        }
        count
    }

    /// Drop the table entry of a terminated process.
    pub fn cleanup(&self, pid: u32) {
        if self.entries.lock().unwrap().remove(&pid).is_some() {
            debug!("cleaned up signal handlers for process {pid}");
        }
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}
