//! The `process.*` syscall surface over the process table.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{
    optional, required, Args, SyscallCategory, SyscallError, SyscallFailure, SyscallRegistry,
};
use crate::process::{ProcessPriority, SpawnRequest};
use crate::runtime_info::RuntimeInfo;

fn info_value(info: &crate::process::ProcessInfo) -> Result<Value, SyscallFailure> {
    serde_json::to_value(info)
        .map_err(|err| SyscallFailure::new(SyscallError::InternalError, err.to_string()))
}

fn priority_from(value: i64) -> Result<ProcessPriority, SyscallFailure> {
    ProcessPriority::from_i64(value).ok_or_else(|| {
        SyscallFailure::new(
            SyscallError::InvalidArgument,
            format!("invalid priority {value}, expected 0-6"),
        )
    })
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::Process;

    let rt = runtime.clone();
    registry.register(
        Process,
        "create_process",
        vec![
            required("name"),
            required("command"),
            optional("args", json!([])),
            optional("env", json!({})),
            optional("cwd", Value::Null),
            optional("user", Value::Null),
            optional("priority", json!(3)),
        ],
        Box::new(move |args: &Args| {
            let extra_args = match args.value("args") {
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        other => Err(SyscallFailure::new(
                            SyscallError::InvalidArgument,
                            format!("argument list must contain strings, got {other}"),
                        )),
                    })
                    .collect::<Result<Vec<String>, _>>()?,
                Value::Null => Vec::new(),
                other => {
                    return Err(SyscallFailure::new(
                        SyscallError::InvalidArgument,
                        format!("parameter 'args' must be a list, got {other}"),
                    ))
                }
            };
            let mut environment = rt.environment.lock().unwrap().clone();
            if let Value::Object(map) = args.value("env") {
                for (key, value) in map {
                    match value {
                        Value::String(s) => {
                            environment.insert(key, s);
                        }
                        other => {
                            return Err(SyscallFailure::new(
                                SyscallError::InvalidArgument,
                                format!("environment values must be strings, got {other}"),
                            ))
                        }
                    }
                }
            }
            let pid = rt.processes.spawn(SpawnRequest {
                name: args.str("name")?,
                command: args.str("command")?,
                args: extra_args,
                environment,
                working_directory: args.opt_str("cwd")?.map(Into::into),
                user: args.opt_str("user")?,
                priority: priority_from(args.i64("priority")?)?,
                parent_pid: None,
            })?;
            Ok(json!(pid))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "terminate_process",
        vec![required("pid"), optional("force", Value::Bool(false))],
        Box::new(move |args: &Args| {
            rt.processes
                .terminate(args.u32("pid")?, args.bool("force")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "get_process_info",
        vec![required("pid")],
        Box::new(move |args: &Args| {
            let info = rt.processes.get_info(args.u32("pid")?)?;
            info_value(&info)
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "get_all_processes",
        vec![],
        Box::new(move |_args: &Args| {
            let mut all = serde_json::Map::new();
            for info in rt.processes.list_infos() {
                all.insert(info.pid.to_string(), info_value(&info)?);
            }
            Ok(Value::Object(all))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "set_process_priority",
        vec![required("pid"), required("priority")],
        Box::new(move |args: &Args| {
            let priority = priority_from(args.i64("priority")?)?;
            rt.processes.set_priority(args.u32("pid")?, priority)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "suspend_process",
        vec![required("pid")],
        Box::new(move |args: &Args| {
            rt.processes.suspend(args.u32("pid")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "resume_process",
        vec![required("pid")],
        Box::new(move |args: &Args| {
            rt.processes.resume(args.u32("pid")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "wait_process",
        vec![required("pid"), optional("timeout", Value::Null)],
        Box::new(move |args: &Args| {
            let pid = args.u32("pid")?;
            let timeout = args
                .opt_f64("timeout")?
                .map(std::time::Duration::from_secs_f64);
            let exit_code = rt.processes.wait(pid, timeout)?;
            Ok(json!({ "pid": pid, "exit_code": exit_code }))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "get_process_children",
        vec![required("pid")],
        Box::new(move |args: &Args| {
            let children = rt.processes.children_of(args.u32("pid")?)?;
            Ok(json!(children))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Process,
        "send_signal",
        vec![required("pid"), required("signal")],
        Box::new(move |args: &Args| {
            let pid = args.u32("pid")?;
            let signal = args.i64("signal")? as i32;
            rt.signals.send(&rt.processes, pid, signal, None)?;
            Ok(Value::Bool(true))
        }),
    );
}
