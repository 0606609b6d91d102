//! Filesystem change notifications.
//!
//! Implements the following RPC methods:
//!
//! | Method         | Description                                        |
//! |----------------|----------------------------------------------------|
//! | `watch.add`    | Watch a path, returns a numeric watch id           |
//! | `watch.remove` | Detach a previously added watch                    |
//!
//! Changes are delivered as `watch.event` notifications:
//! `{ id, path, change, to_path? }` with
//! `change ∈ {create, modify, delete, rename, attrib}`. A kernel queue
//! overflow surfaces as `{ event: "watch.overflow", id }` and the watch
//! stays valid. Events are forwarded as the OS delivers them; the server
//! adds no coalescing of its own.
//!
//! Built on the [`notify`] crate, which abstracts over inotify (Linux)
//! and kqueue (macOS/BSD). The OS event vocabulary is richer than the
//! protocol's five kinds; the mapping lives in [`classify`]: name changes
//! count as `rename`, metadata changes as `attrib`, access events are
//! dropped, and anything else degrades to `modify`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use rmpv::Value;

use crate::ops::params::{kv, opt_bool_param, opt_u64_param, str_param, u64_param};
use crate::rpc::{EventSink, HandlerResult, RpcError, error_code};

// Mask bits selecting which change kinds a watch reports. Zero means all.
pub const MASK_CREATE: u32 = 0x01;
pub const MASK_MODIFY: u32 = 0x02;
pub const MASK_DELETE: u32 = 0x04;
pub const MASK_RENAME: u32 = 0x08;
pub const MASK_ATTRIB: u32 = 0x10;

// ---------------------------------------------------------------------------
// Watcher table
// ---------------------------------------------------------------------------

/// Bookkeeping for one active watch. Dropping the entry (and with it the
/// watcher handle) detaches the OS watch.
struct WatchEntry {
    _watcher: RecommendedWatcher,
}

/// Maps watch ids to active watches. Ids are assigned from a process-wide
/// counter and never reused within a connection.
pub struct WatcherTable {
    inner: Mutex<HashMap<u64, WatchEntry>>,
    next_id: AtomicU64,
}

impl WatcherTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Teardown: detach every watch.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for WatcherTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Event mapping
// ---------------------------------------------------------------------------

/// Map an OS event kind onto the protocol's change vocabulary and its
/// mask bit. `None` drops the event (access notifications carry no
/// information the client cares about).
fn classify(kind: &EventKind) -> Option<(&'static str, u32)> {
    match kind {
        EventKind::Create(_) => Some(("create", MASK_CREATE)),
        EventKind::Remove(_) => Some(("delete", MASK_DELETE)),
        EventKind::Modify(ModifyKind::Name(_)) => Some(("rename", MASK_RENAME)),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(("attrib", MASK_ATTRIB)),
        EventKind::Modify(_) => Some(("modify", MASK_MODIFY)),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(("modify", MASK_MODIFY)),
    }
}

/// Forward one OS event to the client, honouring the watch's mask.
fn forward_event(events: &EventSink, id: u64, mask: u32, event: &Event) {
    if event.need_rescan() {
        events.emit("watch.overflow", vec![kv("id", Value::Integer(id.into()))]);
        return;
    }

    let Some((change, bit)) = classify(&event.kind) else {
        return;
    };
    if mask != 0 && mask & bit == 0 {
        return;
    }

    let path_str =
        |p: &std::path::PathBuf| Value::String(p.to_string_lossy().into_owned().into());

    // A rename observed with both endpoints becomes one event carrying
    // `to_path`; everything else is one event per affected path.
    if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
        && event.paths.len() == 2
    {
        events.emit(
            "watch.event",
            vec![
                kv("id", Value::Integer(id.into())),
                kv("path", path_str(&event.paths[0])),
                kv("change", Value::String(change.into())),
                kv("to_path", path_str(&event.paths[1])),
            ],
        );
        return;
    }

    for path in &event.paths {
        events.emit(
            "watch.event",
            vec![
                kv("id", Value::Integer(id.into())),
                kv("path", path_str(path)),
                kv("change", Value::String(change.into())),
            ],
        );
    }
}

// ---------------------------------------------------------------------------
// RPC method handlers
// ---------------------------------------------------------------------------

/// `watch.add` — start watching a path.
///
/// Params: `{ path, mask: u32, recursive: bool }` — `mask` selects change
/// kinds (0 = all).
///
/// Result: `{ id }`
pub async fn add(params: &Value, table: &WatcherTable, events: &EventSink) -> HandlerResult {
    let path = str_param(params, "path")?;
    let mask = opt_u64_param(params, "mask").unwrap_or(0) as u32;
    let recursive = opt_bool_param(params, "recursive").unwrap_or(false);

    // The watch target must exist up front; notify's own error for this
    // case is backend-specific.
    if let Err(e) = std::fs::symlink_metadata(path) {
        return Err(RpcError::io(e, path));
    }

    let id = table.next_id.fetch_add(1, Ordering::Relaxed);

    let sink = events.clone();
    let mut watcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => forward_event(&sink, id, mask, &event),
            Err(e) => {
                tracing::warn!(watch_id = id, error = %e, "watch backend error");
            }
        })
        .map_err(|e| {
            RpcError::new(error_code::WATCHER_ERROR, format!("failed to create watcher: {e}"))
        })?;

    let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
    watcher.watch(std::path::Path::new(path), mode).map_err(|e| {
        RpcError::new(error_code::WATCHER_ERROR, format!("failed to watch {path}: {e}"))
    })?;

    table.inner.lock().unwrap().insert(id, WatchEntry { _watcher: watcher });

    Ok(Value::Map(vec![kv("id", Value::Integer(id.into()))]))
}

/// `watch.remove` — detach a watch by id.
///
/// Params: `{ id }`
pub async fn remove(params: &Value, table: &WatcherTable) -> HandlerResult {
    let id = u64_param(params, "id")?;

    if table.inner.lock().unwrap().remove(&id).is_some() {
        Ok(Value::Nil)
    } else {
        Err(RpcError::new(error_code::NOT_FOUND, format!("no watch with id {id}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
