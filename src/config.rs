use std::path::PathBuf;

/// Where all on-disk state of a kosd instance lives. Every registry gets
/// handed the directory it owns at construction time, so tests can point a
/// whole runtime at a scratch directory.
#[derive(Clone, Debug)]
pub struct KosConfig {
    pub root: PathBuf,
}

impl KosConfig {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Root from the `KOS_ROOT` environment variable, falling back to `/tmp/kos`.
    pub fn from_env() -> Self {
        let root = std::env::var_os("KOS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/kos"));
        Self { root }
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.root.join("ipc")
    }
    pub fn pipe_dir(&self) -> PathBuf {
        self.ipc_dir().join("pipe")
    }
    pub fn message_queue_dir(&self) -> PathBuf {
        self.ipc_dir().join("message_queue")
    }
    pub fn shared_memory_dir(&self) -> PathBuf {
        self.ipc_dir().join("shared_memory")
    }
    pub fn semaphore_dir(&self) -> PathBuf {
        self.ipc_dir().join("semaphore")
    }

    pub fn service_config_dir(&self) -> PathBuf {
        self.root.join("services").join("config")
    }
    pub fn service_state_dir(&self) -> PathBuf {
        self.root.join("services").join("state")
    }

    pub fn scheduler_config_dir(&self) -> PathBuf {
        self.root.join("scheduler").join("config")
    }
    pub fn scheduler_state_dir(&self) -> PathBuf {
        self.root.join("scheduler").join("state")
    }
    pub fn scheduler_history_dir(&self) -> PathBuf {
        self.root.join("scheduler").join("history")
    }

    /// Create the full directory tree. Registries assume their directories
    /// exist once the runtime is up.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in &[
            self.pipe_dir(),
            self.message_queue_dir(),
            self.shared_memory_dir(),
            self.semaphore_dir(),
            self.service_config_dir(),
            self.service_state_dir(),
            self.scheduler_config_dir(),
            self.scheduler_state_dir(),
            self.scheduler_history_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
