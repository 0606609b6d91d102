//! Directory operations.
//!
//! Implements the following RPC methods:
//!
//! | Method       | Description                                            |
//! |--------------|--------------------------------------------------------|
//! | `dir.list`   | Enumerate entries, optionally with full lstat attrs     |
//! | `dir.create` | Create a directory (optionally with parents and mode)   |
//! | `dir.remove` | Remove a directory (optionally recursively)             |

use rmpv::Value;
use tokio::fs;

use crate::ops::file::attrs_value;
use crate::ops::params::{kv, opt_bool_param, opt_u64_param, str_param};
use crate::rpc::{HandlerResult, RpcError};

/// `dir.list` — enumerate directory entries.
///
/// Params: `{ path, include_attrs: bool, include_hidden: bool }`
///
/// Result: `{ entries: [ { name, attrs? }, … ] }` in the filesystem's
/// natural enumeration order (the client sorts). With `include_attrs`,
/// each entry carries a FileAttributes map; an entry whose stat fails is
/// kept by name with the attrs dropped.
pub async fn list(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let include_attrs = opt_bool_param(params, "include_attrs").unwrap_or(false);
    let include_hidden = opt_bool_param(params, "include_hidden").unwrap_or(true);

    let mut read_dir = fs::read_dir(path).await.map_err(|e| RpcError::io(e, path))?;
    let mut entries = Vec::new();

    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().into_owned();

                if !include_hidden && name.starts_with('.') {
                    continue;
                }

                let mut fields = vec![kv("name", Value::String(name.into()))];

                if include_attrs {
                    // DirEntry::metadata is an lstat; symlinks are reported
                    // as themselves.
                    if let Ok(meta) = entry.metadata().await {
                        let target = if meta.is_symlink() {
                            fs::read_link(entry.path())
                                .await
                                .ok()
                                .map(|t| t.to_string_lossy().into_owned())
                        } else {
                            None
                        };
                        fields.push(kv("attrs", attrs_value(&meta, target)));
                    }
                }

                entries.push(Value::Map(fields));
            }
            Ok(None) => break,
            Err(e) => return Err(RpcError::io(e, path)),
        }
    }

    Ok(Value::Map(vec![kv("entries", Value::Array(entries))]))
}

/// `dir.create` — create a directory.
///
/// Params: `{ path, parents: bool, mode? }`
pub async fn create(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let parents = opt_bool_param(params, "parents").unwrap_or(false);
    let mode = opt_u64_param(params, "mode");

    let mut builder = fs::DirBuilder::new();
    builder.recursive(parents);
    if let Some(mode) = mode {
        builder.mode(mode as u32);
    }

    builder.create(path).await.map_err(|e| RpcError::io(e, path))?;
    Ok(Value::Nil)
}

/// `dir.remove` — remove a directory.
///
/// Params: `{ path, recursive: bool }`
///
/// With `recursive: false` a non-empty directory fails with nothing
/// deleted (a single rmdir syscall; there is no partial state to leave).
pub async fn remove(params: &Value) -> HandlerResult {
    let path = str_param(params, "path")?;
    let recursive = opt_bool_param(params, "recursive").unwrap_or(false);

    let result = if recursive {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_dir(path).await
    };

    result.map_err(|e| RpcError::io(e, path))?;
    Ok(Value::Nil)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
