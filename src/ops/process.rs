//! One-shot process execution.
//!
//! Implements the `process.run` RPC method: spawn a command from argv (no
//! shell), pipe stdin/stdout/stderr, wait for termination, and return the
//! captured output through the adaptive encoder. The same core is reused
//! by `commands.run_parallel`.
//!
//! ## Timeout
//!
//! When `timeout_ms` elapses the child receives SIGTERM; after a 2-second
//! grace period it receives SIGKILL. The response then carries
//! `timed_out: true` together with whatever output was captured before the
//! kill.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::encoding::encoded_bytes;
use crate::ops::params::{
    env_param, kv, opt_bin_param, opt_str_param, opt_u64_param, str_array_param, str_param,
};
use crate::rpc::{HandlerResult, RpcError, error_code};

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Command specification
// ---------------------------------------------------------------------------

/// A fully parsed `process.run` invocation. Also constructed by the batch
/// engine for `commands.run_parallel` entries.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub locale_hint: Option<String>,
}

impl CommandSpec {
    /// Parse a spec from a params map. `cmd` is required; everything else
    /// is optional.
    pub fn from_params(params: &Value) -> Result<Self, RpcError> {
        let cmd = str_param(params, "cmd")?.to_owned();
        let args = str_array_param(params, "args")
            .map(|v| v.into_iter().map(str::to_owned).collect())
            .unwrap_or_default();

        Ok(Self {
            cmd,
            args,
            cwd: opt_str_param(params, "cwd").map(str::to_owned),
            env: env_param(params, "env").unwrap_or_default(),
            stdin: opt_bin_param(params, "stdin").map(<[u8]>::to_vec),
            timeout: opt_u64_param(params, "timeout_ms").map(Duration::from_millis),
            locale_hint: opt_str_param(params, "locale_hint").map(str::to_owned),
        })
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Spawn a reader that drains `source` into a shared buffer. The shared
/// buffer (rather than the task's return value) keeps partial output
/// reachable even if the pipe never reaches EOF — e.g. when a timed-out
/// child leaked the write end to a grandchild.
fn drain_into<R>(mut source: R, buf: Arc<Mutex<Vec<u8>>>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().unwrap().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Execute a [`CommandSpec`] to completion and build the `process.run`
/// result map: `{ exit_code, stdout, stderr, timed_out, signal? }`.
pub async fn run_command(spec: CommandSpec) -> HandlerResult {
    let mut cmd = Command::new(&spec.cmd);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|e| {
        RpcError::new(
            error_code::PROCESS_FAILURE,
            format!("failed to spawn `{}`: {e}", spec.cmd),
        )
    })?;

    let pid = child.id();

    // Feed stdin and close the pipe so the child sees EOF. Write errors are
    // ignored: the child may legitimately exit without reading.
    if let Some(data) = &spec.stdin
        && let Some(mut stdin) = child.stdin.take()
    {
        let _ = stdin.write_all(data).await;
        drop(stdin);
    }

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));

    let stdout_task = child.stdout.take().map(|s| drain_into(s, Arc::clone(&stdout_buf)));
    let stderr_task = child.stderr.take().map(|s| drain_into(s, Arc::clone(&stderr_buf)));

    let mut timed_out = false;
    let status = match spec.timeout {
        None => child.wait().await,
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                timed_out = true;
                if let Some(pid) = pid {
                    // SAFETY: signalling our own child by pid.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        },
    }
    .map_err(|e| {
        RpcError::new(error_code::PROCESS_FAILURE, format!("wait on `{}` failed: {e}", spec.cmd))
    })?;

    // Give the drainers a moment to reach EOF; a hung pipe (grandchild
    // still holding the write end) must not stall the response.
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
            // Partial output stays in the shared buffer.
        }
    }

    let stdout = std::mem::take(&mut *stdout_buf.lock().unwrap());
    let stderr = std::mem::take(&mut *stderr_buf.lock().unwrap());

    let hint = spec.locale_hint.as_deref();
    let mut fields = vec![
        kv(
            "exit_code",
            match status.code() {
                Some(code) => Value::Integer(code.into()),
                None => Value::Nil,
            },
        ),
        kv("stdout", encoded_bytes(stdout, hint)),
        kv("stderr", encoded_bytes(stderr, hint)),
        kv("timed_out", Value::Boolean(timed_out)),
    ];

    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            fields.push(kv("signal", Value::Integer(sig.into())));
        }
    }

    Ok(Value::Map(fields))
}

/// `process.run` — run a command synchronously and collect its output.
///
/// Params: `{ cmd, args?, cwd?, env?, stdin?, timeout_ms?, locale_hint? }`
///
/// Result: `{ exit_code, stdout, stderr, timed_out, signal? }` where
/// stdout/stderr are `{ data, encoding }` pairs. A non-zero exit is not an
/// RPC error; only spawn/wait failures are.
pub async fn run(params: &Value) -> HandlerResult {
    run_command(CommandSpec::from_params(params)?).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
