//! RuntimeInfo owns every registry and the background threads. There are
//! no process-wide globals: tests construct a runtime per scratch root and
//! the dispatcher gets its registries injected from here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::KosConfig;
use crate::ipc::{
    MessageQueueRegistry, PipeRegistry, SemaphoreRegistry, SharedMemoryRegistry, SignalTable,
};
use crate::process::ProcessTable;
use crate::scheduler::JobRegistry;
use crate::services::ServiceRegistry;
use crate::syscall::SyscallRegistry;

/// Cooperative shutdown flag. Every loop thread polls it with at most one
/// second of latency.
pub struct StopToken {
    stopped: AtomicBool,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in slices of at most one second. Returns true
    /// when the token fired before (or while) sleeping.
    pub fn sleep_slices(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(Duration::from_secs(1)));
        }
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of the KOS-level mount table.
pub struct MountEntry {
    pub fs_type: String,
    pub device: Option<String>,
    pub options: Option<String>,
    pub mounted_at: String,
}

pub struct RuntimeInfo {
    pub config: KosConfig,
    pub pipes: Arc<PipeRegistry>,
    pub queues: Arc<MessageQueueRegistry>,
    pub shared_memory: Arc<SharedMemoryRegistry>,
    pub semaphores: Arc<SemaphoreRegistry>,
    pub signals: Arc<SignalTable>,
    pub processes: Arc<ProcessTable>,
    pub services: Arc<ServiceRegistry>,
    pub scheduler: Arc<JobRegistry>,
    /// The emulated process-wide environment, seeded from the host.
    pub environment: Arc<Mutex<HashMap<String, String>>>,
    pub mounts: Mutex<HashMap<String, MountEntry>>,
    hostname: Mutex<String>,
    started: Instant,
    stop: Arc<StopToken>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RuntimeInfo {
    /// Bring the world up: directory layout, registries, persisted
    /// services and jobs, background loops.
    pub fn init(config: KosConfig) -> std::io::Result<Arc<Self>> {
        config.ensure_layout()?;
        info!("initializing kos runtime at {}", config.root.display());

        let environment: Arc<Mutex<HashMap<String, String>>> =
            Arc::new(Mutex::new(std::env::vars().collect()));
        let pipes = Arc::new(PipeRegistry::new(config.pipe_dir()));
        let queues = Arc::new(MessageQueueRegistry::new(config.message_queue_dir()));
        let shared_memory = Arc::new(SharedMemoryRegistry::new(config.shared_memory_dir()));
        let semaphores = Arc::new(SemaphoreRegistry::new(config.semaphore_dir()));
        let signals = Arc::new(SignalTable::new());
        let processes = Arc::new(ProcessTable::new());

        // A terminated process takes its signal table entry with it.
        let weak_signals: Weak<SignalTable> = Arc::downgrade(&signals);
        processes.register_exit_hook(Box::new(move |pid| {
            if let Some(signals) = weak_signals.upgrade() {
                signals.cleanup(pid);
            }
        }));

        let services = Arc::new(ServiceRegistry::new(
            config.service_config_dir(),
            config.service_state_dir(),
            processes.clone(),
            pipes.clone(),
            environment.clone(),
        ));
        let scheduler = Arc::new(JobRegistry::new(
            config.scheduler_config_dir(),
            config.scheduler_state_dir(),
            config.scheduler_history_dir(),
            processes.clone(),
            pipes.clone(),
            environment.clone(),
        ));

        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "kos".to_string());

        let runtime = Arc::new(Self {
            config,
            pipes,
            queues,
            shared_memory,
            semaphores,
            signals,
            processes,
            services,
            scheduler,
            environment,
            mounts: Mutex::new(HashMap::new()),
            hostname: Mutex::new(hostname),
            started: Instant::now(),
            stop: Arc::new(StopToken::new()),
            threads: Mutex::new(Vec::new()),
        });

        runtime.services.load_all();
        runtime.scheduler.load_all();
        runtime.spawn_loops();
        info!("kos runtime initialized");
        Ok(runtime)
    }

    fn spawn_loops(&self) {
        let mut threads = self.threads.lock().unwrap();

        let processes = self.processes.clone();
        let stop = self.stop.clone();
        threads.push(spawn_named("kos-process-table", move || {
            processes.run_loop(&stop)
        }));

        let services = self.services.clone();
        let stop = self.stop.clone();
        threads.push(spawn_named("kos-service-monitor", move || {
            services.run_monitor_loop(&stop)
        }));

        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        threads.push(spawn_named("kos-job-scheduler", move || {
            scheduler.run_scheduler_loop(&stop)
        }));

        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        threads.push(spawn_named("kos-job-executor", move || {
            scheduler.run_executor_loop(&stop)
        }));
    }

    /// The syscall registry wired to this runtime.
    pub fn syscalls(self: &Arc<Self>) -> SyscallRegistry {
        SyscallRegistry::for_runtime(self)
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().unwrap().clone()
    }

    pub fn set_hostname(&self, hostname: String) {
        *self.hostname.lock().unwrap() = hostname;
    }

    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Flip the stop token; loops wind down on their own.
    pub fn request_shutdown(&self) {
        self.stop.stop();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Orderly shutdown: stop services, stop loops, close IPC handles.
    pub fn shutdown(&self) {
        info!("shutting down kos runtime");
        self.services.stop_all();
        self.stop.stop();
        for handle in self.threads.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                warn!("a runtime thread panicked during shutdown");
            }
        }
        self.pipes.close_all();
        self.queues.close_all();
        self.shared_memory.close_all();
        self.semaphores.close_all();
        info!("kos runtime shut down");
    }
}

fn spawn_named<F: FnOnce() + Send + 'static>(name: &str, body: F) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("thread spawn cannot fail with a valid name")
}
