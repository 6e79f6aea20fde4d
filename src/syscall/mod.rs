//! Syscall dispatcher: the single entry point collaborators use to reach
//! the core.
//!
//! Every call is registered under `<category>.<name>` with an ordered
//! parameter list. `invoke` binds positional and keyword arguments against
//! that signature, times the call and wraps the outcome in a
//! `SyscallResult`. Lower layers return their own error enums; this module
//! is the one choke point that converts them into the error taxonomy.
//!
//! Values crossing the boundary are `serde_json::Value`. Byte parameters
//! accept either a string (taken as UTF-8) or an array of byte values;
//! byte returns use a string when the data is valid UTF-8 and an array
//! otherwise.

mod filesystem_calls;
mod ipc_calls;
mod process_calls;
mod scheduler_calls;
mod service_calls;
mod system_calls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;

use crate::ipc::signals::SignalError;
use crate::ipc::IpcError;
use crate::process::{ProcessError, SpawnError};
use crate::runtime_info::RuntimeInfo;
use crate::scheduler::SchedulerError;
use crate::services::ServiceError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyscallError {
    Success,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    ResourceBusy,
    ResourceUnavailable,
    InsufficientResources,
    NotImplemented,
    Timeout,
    Interrupted,
    IoError,
    InternalError,
    NotSupported,
    InvalidState,
    LimitExceeded,
}

impl SyscallError {
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ResourceBusy => "RESOURCE_BUSY",
            Self::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::Timeout => "TIMEOUT",
            Self::Interrupted => "INTERRUPTED",
            Self::IoError => "IO_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::InvalidState => "INVALID_STATE",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
        }
    }
}

/// A failed syscall before it is wrapped into a `SyscallResult`.
#[derive(Debug)]
pub struct SyscallFailure {
    pub code: SyscallError,
    pub message: String,
}

impl SyscallFailure {
    pub fn new<M: Into<String>>(code: SyscallError, message: M) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SyscallFailure {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}: {}", self.code.name(), self.message)
    }
}

impl From<IpcError> for SyscallFailure {
    fn from(err: IpcError) -> Self {
        let code = match &err {
            IpcError::NotFound(_) => SyscallError::NotFound,
            IpcError::AlreadyExists(_) => SyscallError::AlreadyExists,
            IpcError::Closed(_) => SyscallError::InvalidState,
            IpcError::WouldBlock => SyscallError::ResourceBusy,
            IpcError::Timeout => SyscallError::Timeout,
            IpcError::InvalidArgument(_) => SyscallError::InvalidArgument,
            IpcError::LimitExceeded(_) => SyscallError::LimitExceeded,
            IpcError::Corrupt(_) => SyscallError::IoError,
            IpcError::Lock(_) => SyscallError::IoError,
            IpcError::Io(_) => SyscallError::IoError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ProcessError> for SyscallFailure {
    fn from(err: ProcessError) -> Self {
        let code = match &err {
            ProcessError::NotFound(_) => SyscallError::NotFound,
            ProcessError::Timeout(_) => SyscallError::Timeout,
            ProcessError::Signal(_) => SyscallError::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SpawnError> for SyscallFailure {
    fn from(err: SpawnError) -> Self {
        let code = match &err {
            SpawnError::CommandNotFound(_) => SyscallError::NotFound,
            SpawnError::EmptyCommand
            | SpawnError::UnknownUser(_)
            | SpawnError::WorkingDirectory(_) => SyscallError::InvalidArgument,
            SpawnError::Spawn(_, _) => SyscallError::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SignalError> for SyscallFailure {
    fn from(err: SignalError) -> Self {
        let code = match &err {
            SignalError::NoSuchProcess(_) => SyscallError::NotFound,
            SignalError::Delivery(_) => SyscallError::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ServiceError> for SyscallFailure {
    fn from(err: ServiceError) -> Self {
        let code = match &err {
            ServiceError::NotFound(_) | ServiceError::MissingDependency(_, _) => {
                SyscallError::NotFound
            }
            ServiceError::AlreadyExists(_) => SyscallError::AlreadyExists,
            ServiceError::ConflictRunning(_, _) => SyscallError::ResourceBusy,
            ServiceError::DependencyCycle(_) | ServiceError::NotRunning(_) => {
                SyscallError::InvalidState
            }
            ServiceError::DependencyFailed(_, _) | ServiceError::SpawnFailed(_, _) => {
                SyscallError::InternalError
            }
            ServiceError::Io(_, _) => SyscallError::IoError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SchedulerError> for SyscallFailure {
    fn from(err: SchedulerError) -> Self {
        let code = match &err {
            SchedulerError::NotFound(_) => SyscallError::NotFound,
            SchedulerError::AlreadyExists(_) => SyscallError::AlreadyExists,
            SchedulerError::BadSchedule(_, _) => SyscallError::InvalidArgument,
            SchedulerError::NotRunning(_) => SyscallError::InvalidState,
            SchedulerError::Io(_, _) => SyscallError::IoError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<std::io::Error> for SyscallFailure {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => SyscallError::NotFound,
            std::io::ErrorKind::AlreadyExists => SyscallError::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => SyscallError::PermissionDenied,
            _ => SyscallError::IoError,
        };
        Self::new(code, err.to_string())
    }
}

/// What every syscall returns to its caller.
#[derive(Clone, Debug, Serialize)]
pub struct SyscallResult {
    pub success: bool,
    pub error_code: SyscallError,
    pub data: Value,
    pub message: Option<String>,
    pub timestamp: f64,
}

impl SyscallResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            error_code: SyscallError::Success,
            data,
            message: None,
            timestamp: crate::ipc::now_epoch(),
        }
    }

    pub fn err<M: Into<String>>(code: SyscallError, message: M) -> Self {
        Self {
            success: false,
            error_code: code,
            data: Value::Null,
            message: Some(message.into()),
            timestamp: crate::ipc::now_epoch(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyscallCategory {
    Process,
    Memory,
    Filesystem,
    Device,
    Network,
    Security,
    Ipc,
    Time,
    System,
}

impl SyscallCategory {
    pub fn name(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Memory => "memory",
            Self::Filesystem => "filesystem",
            Self::Device => "device",
            Self::Network => "network",
            Self::Security => "security",
            Self::Ipc => "ipc",
            Self::Time => "time",
            Self::System => "system",
        }
    }
}

/// One formal parameter of a syscall signature.
pub struct Param {
    pub name: &'static str,
    pub default: Option<Value>,
}

pub fn required(name: &'static str) -> Param {
    Param {
        name,
        default: None,
    }
}

pub fn optional(name: &'static str, default: Value) -> Param {
    Param {
        name,
        default: Some(default),
    }
}

/// Bound arguments handed to a syscall implementation, with typed getters
/// that fail as `INVALID_ARGUMENT`.
pub struct Args {
    values: HashMap<&'static str, Value>,
}

impl Args {
    fn get(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Null)
    }

    pub fn value(&self, name: &str) -> Value {
        self.get(name).clone()
    }

    pub fn str(&self, name: &str) -> Result<String, SyscallFailure> {
        match self.get(name) {
            Value::String(s) => Ok(s.clone()),
            other => Err(SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be a string, got {other}"),
            )),
        }
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<String>, SyscallFailure> {
        match self.get(name) {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            other => Err(SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be a string or null, got {other}"),
            )),
        }
    }

    pub fn i64(&self, name: &str) -> Result<i64, SyscallFailure> {
        self.get(name).as_i64().ok_or_else(|| {
            SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be an integer"),
            )
        })
    }

    pub fn u32(&self, name: &str) -> Result<u32, SyscallFailure> {
        self.i64(name).and_then(|v| {
            u32::try_from(v).map_err(|_| {
                SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    format!("parameter '{name}' out of range"),
                )
            })
        })
    }

    pub fn bool(&self, name: &str) -> Result<bool, SyscallFailure> {
        self.get(name).as_bool().ok_or_else(|| {
            SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be a boolean"),
            )
        })
    }

    pub fn opt_f64(&self, name: &str) -> Result<Option<f64>, SyscallFailure> {
        match self.get(name) {
            Value::Null => Ok(None),
            other => other.as_f64().map(Some).ok_or_else(|| {
                SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    format!("parameter '{name}' must be a number or null"),
                )
            }),
        }
    }

    pub fn f64(&self, name: &str) -> Result<f64, SyscallFailure> {
        self.get(name).as_f64().ok_or_else(|| {
            SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be a number"),
            )
        })
    }

    pub fn bytes(&self, name: &str) -> Result<Vec<u8>, SyscallFailure> {
        match self.get(name) {
            Value::String(s) => Ok(s.clone().into_bytes()),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|v| u8::try_from(v).ok())
                        .ok_or_else(|| {
                            SyscallFailure::new(
                                SyscallError::InvalidArgument,
                                format!("parameter '{name}' must contain byte values"),
                            )
                        })
                })
                .collect(),
            other => Err(SyscallFailure::new(
                SyscallError::InvalidArgument,
                format!("parameter '{name}' must be a string or byte array, got {other}"),
            )),
        }
    }
}

/// Bytes going back out: a string when valid UTF-8, a byte array otherwise.
pub fn bytes_to_value(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(err) => Value::Array(
            err.into_bytes()
                .into_iter()
                .map(|b| Value::Number(b.into()))
                .collect(),
        ),
    }
}

pub type SyscallHandler = Box<dyn Fn(&Args) -> Result<Value, SyscallFailure> + Send + Sync>;

struct SyscallDef {
    params: Vec<Param>,
    handler: SyscallHandler,
}

/// The `(category, name)`-keyed registry of syscall descriptors.
pub struct SyscallRegistry {
    table: HashMap<String, SyscallDef>,
}

impl SyscallRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Build a registry wired to the given runtime, with every canonical
    /// entry point registered.
    pub fn for_runtime(runtime: &Arc<RuntimeInfo>) -> Self {
        let mut registry = Self::new();
        ipc_calls::register(&mut registry, runtime);
        process_calls::register(&mut registry, runtime);
        system_calls::register(&mut registry, runtime);
        filesystem_calls::register(&mut registry, runtime);
        service_calls::register(&mut registry, runtime);
        scheduler_calls::register(&mut registry, runtime);
        debug!("syscall registry initialized with {} calls", registry.table.len());
        registry
    }

    pub fn register(
        &mut self,
        category: SyscallCategory,
        name: &str,
        params: Vec<Param>,
        handler: SyscallHandler,
    ) {
        let id = format!("{}.{name}", category.name());
        self.table.insert(id, SyscallDef { params, handler });
    }

    /// Entry points the core intentionally omits keep their id but always
    /// return `NOT_IMPLEMENTED`.
    pub fn register_not_implemented(&mut self, category: SyscallCategory, name: &'static str) {
        self.register(
            category,
            name,
            Vec::new(),
            Box::new(move |_args| {
                Err(SyscallFailure::new(
                    SyscallError::NotImplemented,
                    format!("syscall {name} is not implemented"),
                ))
            }),
        );
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.table.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.contains_key(id)
    }

    /// Look up, bind, execute, wrap. Never panics back to the caller; all
    /// failure classes come back as the declared error codes.
    pub fn invoke(
        &self,
        id: &str,
        positional: Vec<Value>,
        keyword: HashMap<String, Value>,
    ) -> SyscallResult {
        let def = match self.table.get(id) {
            Some(def) => def,
            None => {
                return SyscallResult::err(
                    SyscallError::NotFound,
                    format!("system call '{id}' not found"),
                )
            }
        };

        if positional.len() > def.params.len() {
            return SyscallResult::err(
                SyscallError::InvalidArgument,
                format!(
                    "{id} takes at most {} arguments, got {}",
                    def.params.len(),
                    positional.len()
                ),
            );
        }
        let mut values: HashMap<&'static str, Value> = HashMap::new();
        for (param, value) in def.params.iter().zip(positional) {
            values.insert(param.name, value);
        }
        for (key, value) in keyword {
            let param = match def.params.iter().find(|p| p.name == key) {
                Some(param) => param,
                None => {
                    return SyscallResult::err(
                        SyscallError::InvalidArgument,
                        format!("{id} has no parameter '{key}'"),
                    )
                }
            };
            if values.contains_key(param.name) {
                return SyscallResult::err(
                    SyscallError::InvalidArgument,
                    format!("{id}: parameter '{key}' given twice"),
                );
            }
            values.insert(param.name, value);
        }
        for param in &def.params {
            if !values.contains_key(param.name) {
                match &param.default {
                    Some(default) => {
                        values.insert(param.name, default.clone());
                    }
                    None => {
                        return SyscallResult::err(
                            SyscallError::InvalidArgument,
                            format!("{id}: missing required parameter '{}'", param.name),
                        )
                    }
                }
            }
        }

        trace!("syscall invoked: {id}");
        let args = Args { values };
        let started = Instant::now();
        let outcome = (def.handler)(&args);
        let elapsed = started.elapsed();
        match outcome {
            Ok(data) => {
                trace!("syscall {id} finished in {elapsed:?}");
                SyscallResult::ok(data)
            }
            Err(failure) => {
                debug!("syscall {id} failed in {elapsed:?}: {failure}");
                SyscallResult::err(failure.code, failure.message)
            }
        }
    }

    /// Positional-only convenience wrapper.
    pub fn invoke_positional(&self, id: &str, positional: Vec<Value>) -> SyscallResult {
        self.invoke(id, positional, HashMap::new())
    }
}

impl Default for SyscallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
