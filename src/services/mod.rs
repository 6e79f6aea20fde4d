//! Service supervision: a systemd-like manager for long-lived processes
//! with dependency resolution, restart policies and a watchdog.

mod registry;
mod service;

pub use registry::{ServiceError, ServiceRegistry};
pub use service::{
    RestartPolicy, Service, ServiceConfig, ServiceRuntime, ServiceState, ServiceStatus, ServiceType,
};
