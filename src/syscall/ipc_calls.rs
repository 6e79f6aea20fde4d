//! The `ipc.*` syscall surface: pipes, message queues, shared memory,
//! semaphores and signals.

use std::sync::Arc;

use log::info;
use serde_json::{json, Value};

use super::{
    bytes_to_value, optional, required, Args, SyscallCategory, SyscallError, SyscallFailure,
    SyscallRegistry,
};
use crate::ipc::IpcError;
use crate::runtime_info::RuntimeInfo;

fn msgpack_value(value: Value, name: &str) -> Result<rmpv::Value, SyscallFailure> {
    rmpv::ext::to_value(value).map_err(|err| {
        SyscallFailure::new(
            SyscallError::InvalidArgument,
            format!("parameter '{name}' is not serializable: {err}"),
        )
    })
}

fn json_value(value: rmpv::Value) -> Result<Value, SyscallFailure> {
    rmpv::ext::from_value(value).map_err(|err| {
        SyscallFailure::new(
            SyscallError::InternalError,
            format!("message payload cannot be represented: {err}"),
        )
    })
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::Ipc;

    // -- pipes ------------------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "create_pipe",
        vec![
            optional("name", Value::Null),
            optional("buffer_size", json!(4096)),
        ],
        Box::new(move |args: &Args| {
            let name = args.opt_str("name")?;
            let buffer_size = args.u32("buffer_size")?;
            let id = rt.pipes.create(name, buffer_size)?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "open_pipe",
        vec![required("pipe_id")],
        Box::new(move |args: &Args| {
            rt.pipes.open(&args.str("pipe_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "close_pipe",
        vec![required("pipe_id")],
        Box::new(move |args: &Args| {
            rt.pipes.close(&args.str("pipe_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "write_pipe",
        vec![
            required("pipe_id"),
            required("data"),
            optional("nonblocking", Value::Bool(false)),
        ],
        Box::new(move |args: &Args| {
            let id = args.str("pipe_id")?;
            let data = args.bytes("data")?;
            let nonblocking = args.bool("nonblocking")?;
            let written = rt.pipes.write(&id, &data, nonblocking)?;
            Ok(json!(written))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "read_pipe",
        vec![
            required("pipe_id"),
            required("size"),
            optional("nonblocking", Value::Bool(false)),
        ],
        Box::new(move |args: &Args| {
            let id = args.str("pipe_id")?;
            let size = args.u32("size")? as usize;
            let nonblocking = args.bool("nonblocking")?;
            let data = rt.pipes.read(&id, size, nonblocking)?;
            Ok(bytes_to_value(data))
        }),
    );

    // -- message queues ---------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "create_message_queue",
        vec![
            optional("name", Value::Null),
            optional("max_messages", json!(100)),
            optional("max_size", json!(4096)),
        ],
        Box::new(move |args: &Args| {
            let id = rt.queues.create(
                args.opt_str("name")?,
                args.u32("max_messages")?,
                args.u32("max_size")?,
            )?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "delete_message_queue",
        vec![required("queue_id")],
        Box::new(move |args: &Args| {
            rt.queues.delete(&args.str("queue_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "send_message",
        vec![
            required("queue_id"),
            required("message"),
            optional("msg_type", json!(0)),
            optional("priority", json!(0)),
            optional("blocking", Value::Bool(true)),
        ],
        Box::new(move |args: &Args| {
            let id = args.str("queue_id")?;
            let payload = msgpack_value(args.value("message"), "message")?;
            rt.queues.send(
                &id,
                payload,
                args.i64("msg_type")?,
                args.i64("priority")?,
                args.bool("blocking")?,
            )?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "receive_message",
        vec![
            required("queue_id"),
            optional("msg_type", json!(0)),
            optional("blocking", Value::Bool(true)),
        ],
        Box::new(move |args: &Args| {
            let id = args.str("queue_id")?;
            let message = rt
                .queues
                .receive(&id, args.i64("msg_type")?, args.bool("blocking")?)
                .map_err(|err| match err {
                    // an empty queue is a missing resource, not a busy one
                    IpcError::WouldBlock => SyscallFailure::new(
                        SyscallError::ResourceUnavailable,
                        "no message available",
                    ),
                    other => other.into(),
                })?;
            Ok(json!({
                "type": message.msg_type,
                "priority": message.priority,
                "timestamp": message.timestamp,
                "sender_pid": message.sender_pid,
                "data": json_value(message.data)?,
            }))
        }),
    );

    // -- shared memory ----------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "create_shared_memory",
        vec![
            optional("name", Value::Null),
            optional("size", json!(4096)),
            optional("permissions", json!(0o644)),
        ],
        Box::new(move |args: &Args| {
            let id = rt.shared_memory.create(
                args.opt_str("name")?,
                args.u32("size")?,
                args.u32("permissions")?,
            )?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "delete_shared_memory",
        vec![required("shm_id")],
        Box::new(move |args: &Args| {
            rt.shared_memory.delete(&args.str("shm_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "attach_shared_memory",
        vec![required("shm_id")],
        Box::new(move |args: &Args| {
            rt.shared_memory.attach(&args.str("shm_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "detach_shared_memory",
        vec![required("shm_id")],
        Box::new(move |args: &Args| {
            rt.shared_memory.detach(&args.str("shm_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "read_shared_memory",
        vec![
            required("shm_id"),
            required("size"),
            optional("offset", json!(0)),
        ],
        Box::new(move |args: &Args| {
            let segment = rt.shared_memory.get(&args.str("shm_id")?)?;
            let data = segment.read(args.i64("offset")?, args.u32("size")? as usize)?;
            Ok(bytes_to_value(data))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "write_shared_memory",
        vec![
            required("shm_id"),
            required("data"),
            optional("offset", json!(0)),
        ],
        Box::new(move |args: &Args| {
            let segment = rt.shared_memory.get(&args.str("shm_id")?)?;
            let data = args.bytes("data")?;
            let written = segment.write(&data, args.i64("offset")?)?;
            Ok(json!(written))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "lock_shared_memory",
        vec![required("shm_id"), optional("blocking", Value::Bool(true))],
        Box::new(move |args: &Args| {
            let segment = rt.shared_memory.get(&args.str("shm_id")?)?;
            segment.lock(args.bool("blocking")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "unlock_shared_memory",
        vec![required("shm_id")],
        Box::new(move |args: &Args| {
            let segment = rt.shared_memory.get(&args.str("shm_id")?)?;
            segment.unlock()?;
            Ok(Value::Bool(true))
        }),
    );

    // -- semaphores -------------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "create_semaphore",
        vec![
            optional("name", Value::Null),
            optional("value", json!(1)),
            optional("max_value", json!(1)),
        ],
        Box::new(move |args: &Args| {
            let id = rt.semaphores.create(
                args.opt_str("name")?,
                args.u32("value")?,
                args.u32("max_value")?,
            )?;
            Ok(Value::String(id))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "delete_semaphore",
        vec![required("sem_id")],
        Box::new(move |args: &Args| {
            rt.semaphores.delete(&args.str("sem_id")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "acquire_semaphore",
        vec![
            required("sem_id"),
            optional("blocking", Value::Bool(true)),
            optional("timeout", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let semaphore = rt.semaphores.get(&args.str("sem_id")?)?;
            let timeout = args
                .opt_f64("timeout")?
                .map(std::time::Duration::from_secs_f64);
            semaphore.acquire(args.bool("blocking")?, timeout)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "release_semaphore",
        vec![required("sem_id"), optional("count", json!(1))],
        Box::new(move |args: &Args| {
            let semaphore = rt.semaphores.get(&args.str("sem_id")?)?;
            semaphore.release(args.u32("count")?)?;
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "get_semaphore_value",
        vec![required("sem_id")],
        Box::new(move |args: &Args| {
            let semaphore = rt.semaphores.get(&args.str("sem_id")?)?;
            Ok(json!(semaphore.value()))
        }),
    );

    // -- signals ----------------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Ipc,
        "send_signal_to_process",
        vec![
            required("pid"),
            required("signal"),
            optional("data", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let pid = args.u32("pid")?;
            let signal = args.i64("signal")? as i32;
            let data = match args.value("data") {
                Value::Null => None,
                other => Some(other),
            };
            rt.signals.send(&rt.processes, pid, signal, data)?;
            Ok(Value::Bool(true))
        }),
    );

    // Callables cannot cross the value boundary, so this registers the
    // default logging handler; in-process callers install real closures
    // through the SignalTable API.
    let rt = runtime.clone();
    registry.register(
        Ipc,
        "register_signal_handler",
        vec![required("pid"), required("signal")],
        Box::new(move |args: &Args| {
            let pid = args.u32("pid")?;
            let signal = args.i64("signal")? as i32;
            let previous = rt.signals.register_handler(
                pid,
                signal,
                Some(Arc::new(move |signum, _data| {
                    info!("process {pid} received signal {signum}");
                })),
            );
            Ok(Value::Bool(previous.is_some()))
        }),
    );
}
