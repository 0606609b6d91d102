//! System operations.
//!
//! Implements the following RPC methods:
//!
//! | Method          | Description                                       |
//! |-----------------|---------------------------------------------------|
//! | `system.info`   | Identity of the server process and host           |
//! | `system.getenv` | Read an environment variable on the remote        |
//! | `ping`          | Liveness check                                    |

use rmpv::Value;

use crate::ops::params::{kv, str_param};
use crate::rpc::HandlerResult;

/// `system.info` — identity of the server process and host.
///
/// Params: `{}` (none)
///
/// Result: `{ uid, gid, home, hostname, os, arch, server_version }`.
/// `home` and `hostname` are omitted when they cannot be determined.
pub async fn info(_params: &Value) -> HandlerResult {
    let mut fields: Vec<(Value, Value)> = Vec::with_capacity(7);

    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    fields.push(kv("uid", Value::Integer(uid.into())));
    fields.push(kv("gid", Value::Integer(gid.into())));

    if let Some(home) = get_home_dir() {
        fields.push(kv("home", Value::String(home.into())));
    }

    let (os, arch, hostname) = get_uname();
    if let Some(hostname) = hostname {
        fields.push(kv("hostname", Value::String(hostname.into())));
    }
    fields.push(kv("os", Value::String(os.into())));
    fields.push(kv("arch", Value::String(arch.into())));

    fields.push(kv("server_version", Value::String(env!("CARGO_PKG_VERSION").into())));

    Ok(Value::Map(fields))
}

/// `system.getenv` — read an environment variable.
///
/// Params: `{ name }`
///
/// Result: `{ value: str | null }`
pub async fn getenv(params: &Value) -> HandlerResult {
    let name = str_param(params, "name")?;

    let value = match std::env::var(name) {
        Ok(v) => Value::String(v.into()),
        Err(_) => Value::Nil,
    };

    Ok(Value::Map(vec![kv("value", value)]))
}

/// `ping` — liveness check.
///
/// Result: `{ status: "ok", version, pid }`
pub async fn ping(_params: &Value) -> HandlerResult {
    Ok(Value::Map(vec![
        kv("status", Value::String("ok".into())),
        kv("version", Value::String(env!("CARGO_PKG_VERSION").into())),
        kv("pid", Value::Integer((std::process::id() as u64).into())),
    ]))
}

// ---------------------------------------------------------------------------
// Platform helpers
// ---------------------------------------------------------------------------

/// Read sysname, machine, and nodename via `uname(2)`.
fn get_uname() -> (String, String, Option<String>) {
    // SAFETY: uname is a standard POSIX call; the struct is zero-initialised
    // so reading it is safe even if the call fails.
    unsafe {
        let mut buf: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut buf) == 0 {
            let os = std::ffi::CStr::from_ptr(buf.sysname.as_ptr())
                .to_string_lossy()
                .into_owned();
            let arch = std::ffi::CStr::from_ptr(buf.machine.as_ptr())
                .to_string_lossy()
                .into_owned();
            let hostname = std::ffi::CStr::from_ptr(buf.nodename.as_ptr())
                .to_string_lossy()
                .into_owned();
            (os, arch, Some(hostname))
        } else {
            ("unknown".into(), "unknown".into(), None)
        }
    }
}

/// Home directory from $HOME, falling back to the password database.
fn get_home_dir() -> Option<String> {
    if let Ok(home) = std::env::var("HOME")
        && !home.is_empty()
    {
        return Some(home);
    }

    // SAFETY: getuid + getpwuid are standard POSIX calls; the directory
    // string is copied out before any other libc call.
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if pw.is_null() {
            return None;
        }
        let dir = std::ffi::CStr::from_ptr((*pw).pw_dir);
        Some(dir.to_string_lossy().into_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
