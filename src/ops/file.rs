//! File operations.
//!
//! Implements the following RPC methods:
//!
//! | Method          | Description                                         |
//! |-----------------|-----------------------------------------------------|
//! | `file.stat`     | lstat a path; `null` result when the path is absent  |
//! | `file.exists`   | Existence probe (follows symlinks)                   |
//! | `file.read`     | Read contents, whole or a byte range                 |
//! | `file.write`    | Write / append contents, optional creation mode      |
//! | `file.delete`   | Unlink a file                                        |
//! | `file.rename`   | Rename within one filesystem                         |
//! | `file.chmod`    | Set permission bits                                  |
//! | `file.chown`    | Set owner and group                                  |
//! | `file.symlink`  | Create a symbolic link                               |
//! | `file.readlink` | Read a symbolic link's target                        |
//! | `file.copy`     | Copy a file, optionally preserving metadata          |
//! | `file.truename` | Resolve to a canonical path                          |
//!
//! Handlers are stateless and re-entrant; the server adds no locking on
//! top of what the underlying filesystem provides. Paths are used as-is —
//! no tilde or environment expansion.

use std::os::unix::fs::MetadataExt;

use rmpv::Value;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::encoding::encoded_bytes;
use crate::ops::params::{
    bin_param, kv, opt_bool_param, opt_str_param, opt_u64_param, str_param, u64_param,
};
use crate::rpc::{HandlerResult, RpcError, error_code};

// ---------------------------------------------------------------------------
// FileAttributes
// ---------------------------------------------------------------------------

/// Convert metadata into a FileAttributes map. Timestamps are whole
/// seconds since the epoch. `target` is present only for symlinks.
pub(crate) fn attrs_value(meta: &std::fs::Metadata, target: Option<String>) -> Value {
    let file_type = if meta.is_dir() {
        "directory"
    } else if meta.is_symlink() {
        "symlink"
    } else if meta.is_file() {
        "file"
    } else {
        "other"
    };

    let mut entries = vec![
        kv("type", Value::String(file_type.into())),
        kv("size", Value::Integer(meta.size().into())),
        kv("mode", Value::Integer((meta.mode() & 0o7777).into())),
        kv("nlinks", Value::Integer((meta.nlink() as u32).into())),
        kv("uid", Value::Integer(meta.uid().into())),
        kv("gid", Value::Integer(meta.gid().into())),
        kv("atime", Value::Integer(meta.atime().into())),
        kv("mtime", Value::Integer(meta.mtime().into())),
        kv("ctime", Value::Integer(meta.ctime().into())),
        kv("inode", Value::Integer(meta.ino().into())),
        kv("dev", Value::Integer(meta.dev().into())),
    ];

    if let Some(target) = target {
        entries.push(kv("target", Value::String(target.into())));
    }

    Value::Map(entries)
}

// ---------------------------------------------------------------------------
// RPC method handlers
// ---------------------------------------------------------------------------

/// `file.stat` — lstat a single path.
///
/// Params: `{ path }`
///
/// Result: a FileAttributes map, or `null` when the path does not exist
/// (absence is an answer, not an error).
pub async fn stat(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;

    let meta = match fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Nil),
        Err(e) => return Err(RpcError::io(e, path)),
    };

    let target = if meta.is_symlink() {
        fs::read_link(path).await.ok().map(|t| t.to_string_lossy().into_owned())
    } else {
        None
    };

    Ok(attrs_value(&meta, target))
}

/// `file.exists` — existence probe. Follows symlinks, so a dangling link
/// reports `false`. Any stat failure (including permission trouble on a
/// parent) also reports `false`.
pub async fn exists(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    Ok(Value::Boolean(fs::metadata(path).await.is_ok()))
}

/// `file.read` — read file contents.
///
/// Params: `{ path, offset?, length?, locale_hint? }`
///
/// Result: `{ content: { data, encoding }, size }` where `size` counts the
/// bytes actually returned. Without `offset`/`length` the whole file is
/// read.
pub async fn read(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let offset = opt_u64_param(params, "offset");
    let length = opt_u64_param(params, "length");
    let locale_hint = opt_str_param(params, "locale_hint");

    let bytes = if offset.is_none() && length.is_none() {
        fs::read(path).await.map_err(|e| RpcError::io(e, path))?
    } else {
        let mut file = fs::File::open(path).await.map_err(|e| RpcError::io(e, path))?;

        let meta = file.metadata().await.map_err(|e| RpcError::io(e, path))?;
        if meta.is_dir() {
            return Err(RpcError::new(
                error_code::IS_A_DIRECTORY,
                format!("is a directory: {path}"),
            ));
        }

        if let Some(off) = offset
            && off > 0
        {
            file.seek(std::io::SeekFrom::Start(off))
                .await
                .map_err(|e| RpcError::io(e, path))?;
        }

        match length {
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                let mut total = 0usize;
                loop {
                    match file.read(&mut buf[total..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            total += n;
                            if total >= buf.len() {
                                break;
                            }
                        }
                        Err(e) => return Err(RpcError::io(e, path)),
                    }
                }
                buf.truncate(total);
                buf
            }
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await.map_err(|e| RpcError::io(e, path))?;
                buf
            }
        }
    };

    let size = bytes.len() as u64;
    Ok(Value::Map(vec![
        kv("content", encoded_bytes(bytes, locale_hint)),
        kv("size", Value::Integer(size.into())),
    ]))
}

/// `file.write` — write or append file contents.
///
/// Params: `{ path, content: bytes, append: bool, mode? }`
///
/// `mode` applies at creation time (before any bytes land), subject to the
/// process umask; it does not rewrite the mode of a pre-existing file.
///
/// Result: `{ bytes_written }`
pub async fn write(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let content = bin_param(params, "content")?;
    let append = opt_bool_param(params, "append").unwrap_or(false);
    let mode = opt_u64_param(params, "mode");

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    if let Some(mode) = mode {
        opts.mode(mode as u32);
    }

    let mut file = opts.open(path).await.map_err(|e| RpcError::io(e, path))?;
    file.write_all(content).await.map_err(|e| RpcError::io(e, path))?;
    file.flush().await.map_err(|e| RpcError::io(e, path))?;

    Ok(Value::Map(vec![kv(
        "bytes_written",
        Value::Integer((content.len() as u64).into()),
    )]))
}

/// `file.delete` — unlink a file (directories go through `dir.remove`).
pub async fn delete(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    fs::remove_file(path).await.map_err(|e| RpcError::io(e, path))?;
    Ok(Value::Nil)
}

/// `file.rename` — rename within one filesystem.
///
/// Params: `{ from, to, overwrite: bool }`
///
/// With `overwrite: false` an existing destination fails with
/// already-exists. A cross-device rename fails with an I/O error carrying
/// `errno = EXDEV`; the server never falls back to copying.
pub async fn rename(params: &Value) -> HandlerResult {
    let from = str_param(params, "from")?;
    let to = str_param(params, "to")?;
    let overwrite = opt_bool_param(params, "overwrite").unwrap_or(false);

    if !overwrite && fs::symlink_metadata(to).await.is_ok() {
        return Err(RpcError::new(
            error_code::ALREADY_EXISTS,
            format!("destination already exists: {to}"),
        ));
    }

    fs::rename(from, to).await.map_err(|e| {
        if e.raw_os_error() == Some(libc::EXDEV) {
            RpcError::with_data(
                error_code::IO_ERROR,
                format!("cannot rename across devices: {from} -> {to}"),
                Value::Map(vec![kv("errno", Value::Integer(libc::EXDEV.into()))]),
            )
        } else {
            RpcError::io(e, from)
        }
    })?;

    Ok(Value::Nil)
}

/// `file.chmod` — set permission bits.
pub async fn chmod(params: &Value) -> HandlerResult {
    use std::os::unix::fs::PermissionsExt;

    let path = str_param(params, "path")?;
    let mode = u64_param(params, "mode")?;

    let perms = std::fs::Permissions::from_mode(mode as u32);
    fs::set_permissions(path, perms).await.map_err(|e| RpcError::io(e, path))?;
    Ok(Value::Nil)
}

/// `file.chown` — set owner and group.
pub async fn chown(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let uid = u64_param(params, "uid")? as libc::uid_t;
    let gid = u64_param(params, "gid")? as libc::gid_t;

    let c_path = std::ffi::CString::new(path)
        .map_err(|_| RpcError::invalid_params("path contains an interior NUL byte"))?;

    // SAFETY: c_path is a valid NUL-terminated string for the duration of
    // the call.
    let ret = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(RpcError::io(std::io::Error::last_os_error(), path));
    }
    Ok(Value::Nil)
}

/// `file.symlink` — create a symbolic link at `link` pointing to `target`.
/// The target is stored as-is; it need not exist.
pub async fn symlink(params: &Value) -> HandlerResult {
    let target = str_param(params, "target")?;
    let link = str_param(params, "link")?;

    fs::symlink(target, link).await.map_err(|e| RpcError::io(e, link))?;
    Ok(Value::Nil)
}

/// `file.readlink` — read a symbolic link's target.
///
/// Result: `{ target }`
pub async fn readlink(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;

    let target = fs::read_link(path).await.map_err(|e| {
        if e.raw_os_error() == Some(libc::EINVAL) {
            RpcError::new(error_code::IO_ERROR, format!("not a symlink: {path}"))
        } else {
            RpcError::io(e, path)
        }
    })?;

    Ok(Value::Map(vec![kv(
        "target",
        Value::String(target.to_string_lossy().into_owned().into()),
    )]))
}

/// `file.copy` — copy a file.
///
/// Params: `{ from, to, overwrite: bool, preserve: bool }`
///
/// `preserve` carries over mode and mtime; ownership is restored on a
/// best-effort basis and its failure is not fatal.
pub async fn copy(params: &Value) -> HandlerResult {
    use std::os::unix::fs::PermissionsExt;

    let from = str_param(params, "from")?;
    let to = str_param(params, "to")?;
    let overwrite = opt_bool_param(params, "overwrite").unwrap_or(false);
    let preserve = opt_bool_param(params, "preserve").unwrap_or(false);

    if !overwrite && fs::symlink_metadata(to).await.is_ok() {
        return Err(RpcError::new(
            error_code::ALREADY_EXISTS,
            format!("destination already exists: {to}"),
        ));
    }

    let src_meta = fs::metadata(from).await.map_err(|e| RpcError::io(e, from))?;

    fs::copy(from, to).await.map_err(|e| RpcError::io(e, from))?;

    if preserve {
        let perms = std::fs::Permissions::from_mode(src_meta.mode() & 0o7777);
        fs::set_permissions(to, perms).await.map_err(|e| RpcError::io(e, to))?;

        set_times(to, &src_meta).map_err(|e| RpcError::io(e, to))?;

        let c_to = std::ffi::CString::new(to)
            .map_err(|_| RpcError::invalid_params("path contains an interior NUL byte"))?;
        // SAFETY: c_to is valid for the call. Ownership restore is best
        // effort; a failure (e.g. non-root copying a root-owned file) is
        // ignored.
        unsafe {
            libc::chown(c_to.as_ptr(), src_meta.uid(), src_meta.gid());
        }
    }

    Ok(Value::Nil)
}

/// Restore atime/mtime on `path` from source metadata via `utimes(2)`.
fn set_times(path: &str, src: &std::fs::Metadata) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "NUL in path"))?;

    let times = [
        libc::timeval {
            tv_sec: src.atime(),
            tv_usec: (src.atime_nsec() / 1_000) as libc::suseconds_t,
        },
        libc::timeval {
            tv_sec: src.mtime(),
            tv_usec: (src.mtime_nsec() / 1_000) as libc::suseconds_t,
        },
    ];

    // SAFETY: both pointers are valid for the duration of the call.
    let ret = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// `file.truename` — resolve a path to its canonical form (resolving all
/// symlinks and `.` / `..` components).
///
/// Result: `{ path }`
pub async fn truename(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;

    let canonical = fs::canonicalize(path).await.map_err(|e| RpcError::io(e, path))?;
    Ok(Value::Map(vec![kv(
        "path",
        Value::String(canonical.to_string_lossy().into_owned().into()),
    )]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn make_params(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| kv(k, v)).collect())
    }

    fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
        value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
            .unwrap()
    }

    #[tokio::test]
    async fn stat_existing_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hello world").unwrap();

        let params = make_params(vec![("path", Value::String(file.to_str().unwrap().into()))]);
        let result = stat(&params).await.unwrap();

        assert_eq!(field(&result, "type").as_str(), Some("file"));
        assert_eq!(field(&result, "size").as_u64(), Some(11));
        assert!(field(&result, "mtime").as_i64().is_some());
        assert!(field(&result, "inode").as_u64().is_some());
    }

    #[tokio::test]
    async fn stat_absent_path_is_null() {
        let params = make_params(vec![(
            "path",
            Value::String("/tmp/__tramp_rpc_nonexistent_12345__".into()),
        )]);
        let result = stat(&params).await.unwrap();
        assert!(result.is_nil());
    }

    #[tokio::test]
    async fn stat_symlink_includes_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.txt");
        let link = dir.path().join("link.txt");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let params = make_params(vec![("path", Value::String(link.to_str().unwrap().into()))]);
        let result = stat(&params).await.unwrap();

        assert_eq!(field(&result, "type").as_str(), Some("symlink"));
        assert_eq!(field(&result, "target").as_str(), target.to_str());
    }

    #[tokio::test]
    async fn exists_follows_symlinks() {
        let dir = TempDir::new().unwrap();
        let dangling = dir.path().join("dangling");
        std::os::unix::fs::symlink("/nonexistent-target", &dangling).unwrap();

        let params =
            make_params(vec![("path", Value::String(dangling.to_str().unwrap().into()))]);
        assert_eq!(exists(&params).await.unwrap(), Value::Boolean(false));

        let params =
            make_params(vec![("path", Value::String(dir.path().to_str().unwrap().into()))]);
        assert_eq!(exists(&params).await.unwrap(), Value::Boolean(true));
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("rw.bin");
        let data = b"\x00\x01\x02\xff binary data".to_vec();

        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("content", Value::Binary(data.clone())),
            ("append", Value::Boolean(false)),
        ]);
        let result = write(&params).await.unwrap();
        assert_eq!(field(&result, "bytes_written").as_u64(), Some(data.len() as u64));

        let params = make_params(vec![("path", Value::String(file.to_str().unwrap().into()))]);
        let result = read(&params).await.unwrap();
        let content = field(&result, "content");
        assert_eq!(field(content, "encoding").as_str(), Some("binary"));
        assert_eq!(field(content, "data").as_slice(), Some(&data[..]));
        assert_eq!(field(&result, "size").as_u64(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn read_utf8_reports_text() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("text.txt");
        std::fs::write(&file, b"hello world").unwrap();

        let params = make_params(vec![("path", Value::String(file.to_str().unwrap().into()))]);
        let result = read(&params).await.unwrap();
        let content = field(&result, "content");
        assert_eq!(field(content, "encoding").as_str(), Some("utf-8"));
        assert_eq!(field(content, "data").as_str(), Some("hello world"));
        assert_eq!(field(&result, "size").as_u64(), Some(11));
    }

    #[tokio::test]
    async fn read_range() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("ranged.bin");
        std::fs::write(&file, b"ABCDEFGHIJ").unwrap();

        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("offset", Value::Integer(3.into())),
            ("length", Value::Integer(4.into())),
        ]);
        let result = read(&params).await.unwrap();
        let content = field(&result, "content");
        assert_eq!(field(content, "data").as_str(), Some("DEFG"));
        assert_eq!(field(&result, "size").as_u64(), Some(4));
    }

    #[tokio::test]
    async fn read_past_eof_is_short() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("short.bin");
        std::fs::write(&file, b"AB").unwrap();

        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("offset", Value::Integer(10.into())),
            ("length", Value::Integer(100.into())),
        ]);
        let result = read(&params).await.unwrap();
        assert_eq!(field(&result, "size").as_u64(), Some(0));
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let params = make_params(vec![(
            "path",
            Value::String("/tmp/__tramp_rpc_read_nonexistent__".into()),
        )]);
        let err = read(&params).await.unwrap_err();
        assert_eq!(err.code, error_code::NOT_FOUND);
    }

    #[tokio::test]
    async fn write_append_extends() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("log.txt");

        for chunk in [&b"one"[..], &b" two"[..]] {
            let params = make_params(vec![
                ("path", Value::String(file.to_str().unwrap().into())),
                ("content", Value::Binary(chunk.to_vec())),
                ("append", Value::Boolean(true)),
            ]);
            write(&params).await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one two");
    }

    #[tokio::test]
    async fn write_mode_applies_at_creation() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("script.sh");

        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("content", Value::Binary(b"#!/bin/sh\n".to_vec())),
            ("append", Value::Boolean(false)),
            ("mode", Value::Integer(0o755.into())),
        ]);
        write(&params).await.unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }

    #[tokio::test]
    async fn rename_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        std::fs::write(&from, b"a").unwrap();
        std::fs::write(&to, b"b").unwrap();

        let params = make_params(vec![
            ("from", Value::String(from.to_str().unwrap().into())),
            ("to", Value::String(to.to_str().unwrap().into())),
            ("overwrite", Value::Boolean(false)),
        ]);
        let err = rename(&params).await.unwrap_err();
        assert_eq!(err.code, error_code::ALREADY_EXISTS);

        // With overwrite it goes through.
        let params = make_params(vec![
            ("from", Value::String(from.to_str().unwrap().into())),
            ("to", Value::String(to.to_str().unwrap().into())),
            ("overwrite", Value::Boolean(true)),
        ]);
        rename(&params).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "a");
    }

    #[tokio::test]
    async fn chmod_changes_permissions() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x");
        std::fs::write(&file, b"x").unwrap();

        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("mode", Value::Integer(0o600.into())),
        ]);
        chmod(&params).await.unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn chown_to_self_succeeds() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("owned");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        // Re-assert the current owner: always permitted.
        let params = make_params(vec![
            ("path", Value::String(file.to_str().unwrap().into())),
            ("uid", Value::Integer(meta.uid().into())),
            ("gid", Value::Integer(meta.gid().into())),
        ]);
        chown(&params).await.unwrap();
    }

    #[tokio::test]
    async fn symlink_and_readlink() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("ln");

        let params = make_params(vec![
            ("target", Value::String("/etc/hosts".into())),
            ("link", Value::String(link.to_str().unwrap().into())),
        ]);
        symlink(&params).await.unwrap();

        let params = make_params(vec![("path", Value::String(link.to_str().unwrap().into()))]);
        let result = readlink(&params).await.unwrap();
        assert_eq!(field(&result, "target").as_str(), Some("/etc/hosts"));
    }

    #[tokio::test]
    async fn readlink_on_regular_file_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let params = make_params(vec![("path", Value::String(file.to_str().unwrap().into()))]);
        let err = readlink(&params).await.unwrap_err();
        assert!(err.message.contains("not a symlink"), "{}", err.message);
    }

    #[tokio::test]
    async fn copy_preserve_keeps_mode_and_mtime() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("src");
        let to = dir.path().join("dst");
        std::fs::write(&from, b"copy me").unwrap();
        std::fs::set_permissions(&from, std::fs::Permissions::from_mode(0o640)).unwrap();

        let params = make_params(vec![
            ("from", Value::String(from.to_str().unwrap().into())),
            ("to", Value::String(to.to_str().unwrap().into())),
            ("overwrite", Value::Boolean(false)),
            ("preserve", Value::Boolean(true)),
        ]);
        copy(&params).await.unwrap();

        let src_meta = std::fs::metadata(&from).unwrap();
        let dst_meta = std::fs::metadata(&to).unwrap();
        assert_eq!(dst_meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(dst_meta.mtime(), src_meta.mtime());
        assert_eq!(std::fs::read(&to).unwrap(), b"copy me");
    }

    #[tokio::test]
    async fn copy_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("src");
        let to = dir.path().join("dst");
        std::fs::write(&from, b"a").unwrap();
        std::fs::write(&to, b"b").unwrap();

        let params = make_params(vec![
            ("from", Value::String(from.to_str().unwrap().into())),
            ("to", Value::String(to.to_str().unwrap().into())),
            ("overwrite", Value::Boolean(false)),
        ]);
        let err = copy(&params).await.unwrap_err();
        assert_eq!(err.code, error_code::ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn delete_nonexistent_is_not_found() {
        let params = make_params(vec![(
            "path",
            Value::String("/tmp/__tramp_rpc_del_nonexistent__".into()),
        )]);
        let err = delete(&params).await.unwrap_err();
        assert_eq!(err.code, error_code::NOT_FOUND);
    }

    #[tokio::test]
    async fn truename_resolves_dot_components() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("real.txt");
        std::fs::write(&file, b"").unwrap();

        let messy = dir.path().join(".").join("real.txt");
        let params =
            make_params(vec![("path", Value::String(messy.to_str().unwrap().into()))]);
        let result = truename(&params).await.unwrap();
        assert_eq!(
            field(&result, "path").as_str().unwrap(),
            file.canonicalize().unwrap().to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn stat_missing_param_is_invalid() {
        let err = stat(&Value::Map(vec![])).await.unwrap_err();
        assert_eq!(err.code, error_code::INVALID_PARAMS);
    }
}
