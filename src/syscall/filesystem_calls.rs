//! The `filesystem.*` syscall surface. Mount syscalls operate on the
//! runtime's mount table (KOS-level bookkeeping, never real host mounts);
//! the file and directory syscalls act on the host filesystem with the
//! optional `cwd` argument resolved first.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use super::{
    bytes_to_value, optional, required, Args, SyscallCategory, SyscallError, SyscallFailure,
    SyscallRegistry,
};
use crate::runtime_info::{MountEntry, RuntimeInfo};

fn resolve(path: &str, cwd: Option<String>) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        match cwd {
            Some(cwd) => Path::new(&cwd).join(path),
            None => path.to_path_buf(),
        }
    }
}

fn file_info(path: &Path) -> Result<Value, SyscallFailure> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64());
    Ok(json!({
        "name": path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        "path": path.display().to_string(),
        "is_dir": metadata.is_dir(),
        "is_file": metadata.is_file(),
        "size": metadata.len(),
        "modified": modified,
    }))
}

pub fn register(registry: &mut SyscallRegistry, runtime: &Arc<RuntimeInfo>) {
    use SyscallCategory::Filesystem;

    // -- mount table ------------------------------------------------------

    let rt = runtime.clone();
    registry.register(
        Filesystem,
        "mount_filesystem",
        vec![
            required("fs_type"),
            required("mount_point"),
            optional("device", Value::Null),
            optional("options", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let mount_point = args.str("mount_point")?;
            let mut mounts = rt.mounts.lock().unwrap();
            if mounts.contains_key(&mount_point) {
                return Err(SyscallFailure::new(
                    SyscallError::AlreadyExists,
                    format!("{mount_point} is already mounted"),
                ));
            }
            mounts.insert(
                mount_point,
                MountEntry {
                    fs_type: args.str("fs_type")?,
                    device: args.opt_str("device")?,
                    options: args.opt_str("options")?,
                    mounted_at: chrono::Utc::now().to_rfc3339(),
                },
            );
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Filesystem,
        "unmount_filesystem",
        vec![required("mount_point")],
        Box::new(move |args: &Args| {
            let mount_point = args.str("mount_point")?;
            if rt.mounts.lock().unwrap().remove(&mount_point).is_none() {
                return Err(SyscallFailure::new(
                    SyscallError::NotFound,
                    format!("{mount_point} is not mounted"),
                ));
            }
            Ok(Value::Bool(true))
        }),
    );

    let rt = runtime.clone();
    registry.register(
        Filesystem,
        "get_mounted_filesystems",
        vec![],
        Box::new(move |_args: &Args| {
            let mounts = rt.mounts.lock().unwrap();
            let mut table = serde_json::Map::new();
            for (mount_point, entry) in mounts.iter() {
                table.insert(
                    mount_point.clone(),
                    json!({
                        "fs_type": entry.fs_type,
                        "device": entry.device,
                        "options": entry.options,
                        "mounted_at": entry.mounted_at,
                    }),
                );
            }
            Ok(Value::Object(table))
        }),
    );

    // -- files and directories --------------------------------------------

    registry.register(
        Filesystem,
        "create_file",
        vec![required("path"), optional("cwd", Value::Null)],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            if path.exists() {
                return Err(SyscallFailure::new(
                    SyscallError::AlreadyExists,
                    format!("{} already exists", path.display()),
                ));
            }
            std::fs::File::create(&path)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "delete_file",
        vec![required("path"), optional("cwd", Value::Null)],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            std::fs::remove_file(&path)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "create_directory",
        vec![required("path"), optional("cwd", Value::Null)],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            std::fs::create_dir_all(&path)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "delete_directory",
        vec![
            required("path"),
            optional("recursive", Value::Bool(false)),
            optional("cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            if args.bool("recursive")? {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_dir(&path)?;
            }
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "list_directory",
        vec![required("path"), optional("cwd", Value::Null)],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                entries.push(file_info(&entry.path())?);
            }
            Ok(Value::Array(entries))
        }),
    );

    registry.register(
        Filesystem,
        "get_file_info",
        vec![required("path"), optional("cwd", Value::Null)],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            file_info(&path)
        }),
    );

    registry.register(
        Filesystem,
        "read_file",
        vec![
            required("path"),
            optional("offset", json!(0)),
            optional("size", json!(-1)),
            optional("cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            let offset = args.i64("offset")?;
            if offset < 0 {
                return Err(SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    "offset must not be negative",
                ));
            }
            let size = args.i64("size")?;
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            let data = if size < 0 {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                data
            } else {
                let mut data = vec![0u8; size as usize];
                let mut filled = 0;
                while filled < data.len() {
                    let count = file.read(&mut data[filled..])?;
                    if count == 0 {
                        break;
                    }
                    filled += count;
                }
                data.truncate(filled);
                data
            };
            Ok(bytes_to_value(data))
        }),
    );

    registry.register(
        Filesystem,
        "write_file",
        vec![
            required("path"),
            required("data"),
            optional("offset", json!(0)),
            optional("cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            let offset = args.i64("offset")?;
            if offset < 0 {
                return Err(SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    "offset must not be negative",
                ));
            }
            let data = args.bytes("data")?;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            file.write_all(&data)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "copy_file",
        vec![
            required("src_path"),
            required("dst_path"),
            optional("src_cwd", Value::Null),
            optional("dst_cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let src = resolve(&args.str("src_path")?, args.opt_str("src_cwd")?);
            let dst = resolve(&args.str("dst_path")?, args.opt_str("dst_cwd")?);
            std::fs::copy(&src, &dst)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "move_file",
        vec![
            required("src_path"),
            required("dst_path"),
            optional("src_cwd", Value::Null),
            optional("dst_cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let src = resolve(&args.str("src_path")?, args.opt_str("src_cwd")?);
            let dst = resolve(&args.str("dst_path")?, args.opt_str("dst_cwd")?);
            std::fs::rename(&src, &dst)?;
            Ok(Value::Bool(true))
        }),
    );

    registry.register(
        Filesystem,
        "rename",
        vec![
            required("path"),
            required("new_name"),
            optional("cwd", Value::Null),
        ],
        Box::new(move |args: &Args| {
            let path = resolve(&args.str("path")?, args.opt_str("cwd")?);
            let new_name = args.str("new_name")?;
            if new_name.contains('/') {
                return Err(SyscallFailure::new(
                    SyscallError::InvalidArgument,
                    "new_name must be a bare name, not a path",
                ));
            }
            let target = path
                .parent()
                .map(|parent| parent.join(&new_name))
                .unwrap_or_else(|| PathBuf::from(&new_name));
            std::fs::rename(&path, &target)?;
            Ok(Value::Bool(true))
        }),
    );
}
