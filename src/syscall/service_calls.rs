//! The service-management syscalls under `system.*`: the systemctl
//! contract of the supervisor, reached through the dispatcher like every
//! other collaborator surface.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::{
    optional, required, Args, SyscallCategory, SyscallError, SyscallFailure, SyscallRegistry,
};
use crate::runtime_info::RuntimeInfo;
use crate::services::{RestartPolicy, ServiceConfig, ServiceType};

pub(super) fn string_list(value: Value, name: &str) -> Result<Vec<String>, SyscallFailure> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    format!("parameter '{name}' must contain strings, got {other}"),
                )),
            })
            .collect(),
        other => Err(SyscallFailure::new(
            SyscallError::InvalidArgument,
            format!("parameter '{name}' must be a list, got {other}"),
        )),
    }
}

pub(super) fn string_map(
    value: Value,
    name: &str,
) -> Result<HashMap<String, String>, SyscallFailure> {
    match value {
        Value::Null => Ok(HashMap::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, item)| match item {
                Value::String(s) => Ok((key, s)),
                other => Err(SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    format!("parameter '{name}' must map to strings, got {other}"),
                )),
            })
            .collect(),
        other => Err(SyscallFailure::new(
            SyscallError::InvalidArgument,
            format!("parameter '{name}' must be an object, got {other}"),
        )),
    }
}

/// Parse one of the SCREAMING_SNAKE_CASE config enums from its name.
fn parse_variant<T: serde::de::DeserializeOwned>(
    name: &str,
    value: &str,
) -> Result<T, SyscallFailure> {
    serde_json::from_value(Value::String(value.to_ascii_uppercase())).map_err(|_| {
        SyscallFailure::new(
            SyscallError::InvalidArgument,
            format!("invalid value '{value}' for parameter '{name}'"),
        )
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, SyscallFailure> {
    serde_json::to_value(value)
        .map_err(|err| SyscallFailure::new(SyscallError::InternalError, err.to_string()))
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::System;

    let rt = runtime.clone();
    registry.register(
        System,
        "create_service",
        vec![
            required("name"),
            required("exec_start"),
            optional("description", Value::Null),
            optional("service_type", json!("SIMPLE")),
            optional("restart_policy", json!("ON_FAILURE")),
            optional("working_directory", Value::Null),
            optional("user", Value::Null),
            optional("environment", json!({})),
            optional("dependencies", json!([])),
            optional("conflicts", json!([])),
            optional("watchdog_sec", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let name = args.str("name")?;
            let config = ServiceConfig {
                id: String::new(),
                description: args
                    .opt_str("description")?
                    .unwrap_or_else(|| format!("KOS service: {name}")),
                name,
                exec_start: args.str("exec_start")?,
                service_type: parse_variant::<ServiceType>(
                    "service_type",
                    &args.str("service_type")?,
                )?,
                restart_policy: parse_variant::<RestartPolicy>(
                    "restart_policy",
                    &args.str("restart_policy")?,
                )?,
                working_directory: args.opt_str("working_directory")?.map(Into::into),
                user: args.opt_str("user")?,
                environment: string_map(args.value("environment"), "environment")?,
                dependencies: string_list(args.value("dependencies"), "dependencies")?,
                conflicts: string_list(args.value("conflicts"), "conflicts")?,
                watchdog_sec: args.opt_f64("watchdog_sec")?,
            };
            let id = rt.services.create(config)?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "delete_service",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.services.delete(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "start_service",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.services.start(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "stop_service",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.services.stop(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "restart_service",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.services.restart(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "reload_service",
        vec![required("name")],
        Box::new(move |args: &Args| {
            rt.services.reload(&args.str("name")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "list_services",
        vec![],
        Box::new(move |_args: &Args| to_value(&rt.services.list())),
    );

    let rt = runtime.clone();
    registry.register(
        System,
        "get_service_status",
        vec![required("name")],
        Box::new(move |args: &Args| {
            let status = rt.services.status(&args.str("name")?)?;
            to_value(&status)
        }),
    );
}
