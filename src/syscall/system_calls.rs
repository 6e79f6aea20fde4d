//! The `system.*` syscall surface, plus the `memory.*` stubs for the
//! out-of-scope memory manager.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::{json, Value};

use super::{optional, required, Args, SyscallCategory, SyscallRegistry};
use crate::runtime_info::RuntimeInfo;

/// Load averages from the host, zeroes where unavailable.
fn load_averages() -> (f64, f64, f64) {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|content| {
            let mut fields = content.split_whitespace();
            Some((
                fields.next()?.parse().ok()?,
                fields.next()?.parse().ok()?,
                fields.next()?.parse().ok()?,
            ))
        })
        .unwrap_or((0.0, 0.0, 0.0))
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::{Memory, System};

    let rt = runtime.clone();
    registry.register(
        System,
        "get_system_info",
        vec![],
        Box::new(move |_args: &Args| {
            Ok(json!({
                "hostname": rt.hostname(),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "family": std::env::consts::FAMILY,
                "kos_pid": std::process::id(),
                "uptime": rt.uptime(),
                "storage_root": rt.config.root.display().to_string(),
            }))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_environment_variable",
        vec![required("name")],
        Box::new(move |args: &Args| {
            let name = args.str("name")?;
            let environment = rt.environment.lock().unwrap();
            Ok(environment
                .get(&name)
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "set_environment_variable",
        vec![required("name"), required("value")],
        Box::new(move |args: &Args| {
            let name = args.str("name")?;
            let value = args.str("value")?;
            rt.environment.lock().unwrap().insert(name, value);
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_all_environment_variables",
        vec![],
        Box::new(move |_args: &Args| {
            let environment = rt.environment.lock().unwrap();
            Ok(Value::Object(
                environment
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ))
        }),
    );

    registry.register(
        System,
        "get_current_time",
        vec![],
        Box::new(move |_args: &Args| Ok(json!(crate::ipc::now_epoch()))),
    );

    registry.register(
        System,
        "sleep",
        vec![required("seconds")],
        Box::new(move |args: &Args| {
            let seconds = args.f64("seconds")?;
            if seconds > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(seconds));
            }
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_system_load",
        vec![],
        Box::new(move |_args: &Args| {
            let (one, five, fifteen) = load_averages();
            let (live, total) = rt.processes.counts();
            Ok(json!({
                "load_1m": one,
                "load_5m": five,
                "load_15m": fifteen,
                "processes_running": live,
                "processes_total": total,
            }))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "shutdown_system",
        vec![optional("reboot", Value::Bool(false))],
        Box::new(move |args: &Args| {
            let reboot = args.bool("reboot")?;
            info!(
                "shutdown requested through syscall (reboot = {reboot})"
            );
            rt.request_shutdown();
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_system_uptime",
        vec![],
        Box::new(move |_args: &Args| Ok(json!(rt.uptime()))),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_hostname",
        vec![],
        Box::new(move |_args: &Args| Ok(Value::String(rt.hostname()))),
    );

    // Emulated: updates the runtime's view only, never the host.
    let rt = runtime.clone();
    registry.register(
        System,
        "set_hostname",
        vec![required("hostname")],
        Box::new(move |args: &Args| {
            rt.set_hostname(args.str("hostname")?);
            Ok(Value::Bool(true))
        }),
    );

    // The memory manager is an external collaborator; its syscall ids stay
    // registered so callers get NOT_IMPLEMENTED instead of NOT_FOUND.
    for name in [
        "allocate_memory",
        "free_memory",
        "get_memory_info",
        "create_memory_map",
        "delete_memory_map",
        "get_memory_maps",
    ] {
        registry.register_not_implemented(Memory, name);
    }
}
