//! The scheduler syscalls under `time.*`: the crontab contract of the job
//! scheduler.

use std::sync::Arc;

use serde_json::{json, Value};

use super::service_calls::string_map;
use super::{
    optional, required, Args, SyscallCategory, SyscallError, SyscallFailure, SyscallRegistry,
};
use crate::runtime_info::RuntimeInfo;
use crate::scheduler::JobConfig;

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, SyscallFailure> {
    serde_json::to_value(value)
        .map_err(|err| SyscallFailure::new(SyscallError::InternalError, err.to_string()))
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::Time;

    let rt = runtime.clone();
    registry.register(
        Time,
        "create_job",
        vec![
            required("name"),
            required("command"),
            optional("schedule", Value::Null),
            optional("enabled", Value::Bool(true)),
            optional("working_directory", Value::Null),
            optional("environment", json!({})),
            optional("user", Value::Null),
            optional("description", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let config = JobConfig {
                id: String::new(),
                name: args.str("name")?,
                command: args.str("command")?,
                schedule: args.opt_str("schedule")?,
                enabled: args.bool("enabled")?,
                working_directory: args.opt_str("working_directory")?.map(Into::into),
                environment: string_map(args.value("environment"), "environment")?,
                user: args.opt_str("user")?,
                description: args.opt_str("description")?,
            };
            let id = rt.scheduler.create(config)?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "delete_job",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.scheduler.delete(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "enable_job",
        vec![required("name"), optional("enabled", Value::Bool(true))],
        Box::new(move |args: &Args| {
            rt.scheduler
                .enable(&args.str("name")?, args.bool("enabled")?)?;
            Ok(Value::Bool(true))
        }),
    );

    // A null command or schedule leaves that field unchanged.
    let rt = runtime.clone();
    registry.register(
        Time,
        "update_job",
        vec![
            required("name"),
            optional("command", Value::Null),
            optional("schedule", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let command = args.opt_str("command")?;
            let schedule = args.opt_str("schedule")?.map(Some);
            rt.scheduler.update(&args.str("name")?, command, schedule)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "run_job_now",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.scheduler.run_now(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "cancel_job",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.scheduler.cancel(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "list_jobs",
        vec![],
        Box::new(move |_args: &Args| to_value(&rt.scheduler.list())),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "get_job_status",
        vec![required("name")],
        Box::new(move |args: &Args| {
            let snapshot = rt.scheduler.snapshot(&args.str("name")?)?;
            to_value(&snapshot)
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Time,
        "get_job_history",
        vec![required("name"), optional("limit", json!(10))],
        Box::new(move |args: &Args| {
            let limit = args.u32("limit")? as usize;
            let history = rt.scheduler.history(&args.str("name")?, limit)?;
            to_value(&history)
        }),
    );
}
