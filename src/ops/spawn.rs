//! Long-lived child processes with streamed output.
//!
//! Implements the following RPC methods:
//!
//! | Method               | Description                                     |
//! |----------------------|-------------------------------------------------|
//! | `process.start`      | Spawn a child (pipes or PTY), return its pid     |
//! | `process.write_stdin`| Write to the child's stdin, optionally close     |
//! | `process.signal`     | Deliver a signal by name or number               |
//! | `process.resize_pty` | Change the PTY window size                       |
//! | `process.stop`       | Signal, await exit, escalate to SIGKILL          |
//!
//! Every started child gets a drainer task per output stream. Drainers
//! forward output to the client as `process.output` notifications in
//! fragments of at most 64 KiB; fragment boundaries carry no meaning.
//! When the child exits, the drainers finish first, then a single
//! `process.exit` notification is emitted and the pid becomes invalid —
//! further operations on it return no-such-process.
//!
//! A process moves through `STARTING → RUNNING → EXITING → GONE`; only a
//! RUNNING process accepts `write_stdin`, `signal`, and `resize_pty`. The
//! table entry exists exactly for the RUNNING and EXITING phases.
//!
//! ## PTY mode
//!
//! With `pty: { cols, rows, term }` the child is connected to the slave
//! side of a pseudo-terminal: new session, controlling terminal set,
//! window size initialised, TERM taken from the request. The server keeps
//! the master for I/O and resize ioctls; output streams as `"pty"`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::ops::params::{
    bin_param, env_param, field, kv, opt_bool_param, opt_str_param, opt_u64_param,
    str_array_param, str_param, u16_param, u64_param,
};
use crate::rpc::{EventSink, HandlerResult, RpcError, error_code};

/// Upper bound on a single `process.output` fragment.
const OUTPUT_FRAGMENT: usize = 64 * 1024;

/// Default `process.stop` wait before escalating to SIGKILL.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Resolve a signal given by number or by name (`"TERM"` and `"SIGTERM"`
/// both work). The name table is deliberately explicit; exotic platform
/// signals are out of scope.
fn signal_from_value(value: &Value) -> Result<i32, RpcError> {
    if let Some(n) = value.as_i64() {
        if (1..=64).contains(&n) {
            return Ok(n as i32);
        }
        return Err(RpcError::invalid_params(format!("signal number out of range: {n}")));
    }

    let Some(name) = value.as_str() else {
        return Err(RpcError::invalid_params("signal must be a name or a number"));
    };

    let bare = name.strip_prefix("SIG").unwrap_or(name);
    let sig = match bare.to_ascii_uppercase().as_str() {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ABRT" => libc::SIGABRT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "WINCH" => libc::SIGWINCH,
        other => {
            return Err(RpcError::invalid_params(format!("unknown signal name: {other}")));
        }
    };
    Ok(sig)
}

/// Deliver `sig` to `pid`. ESRCH is reported as no-such-process.
fn send_signal(pid: u32, sig: i32) -> Result<(), RpcError> {
    // SAFETY: plain kill(2) on a pid we spawned.
    let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(no_such_process(pid));
        }
        return Err(RpcError::new(
            error_code::PROCESS_FAILURE,
            format!("failed to signal pid {pid}: {err}"),
        ));
    }
    Ok(())
}

fn no_such_process(pid: u32) -> RpcError {
    RpcError::new(error_code::NO_SUCH_PROCESS, format!("no such process: {pid}"))
}

// ---------------------------------------------------------------------------
// Exit reporting
// ---------------------------------------------------------------------------

/// How a child terminated: a normal exit code or a fatal signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self { exit_code: status.code(), signal: status.signal() }
    }

    fn unknown() -> Self {
        Self { exit_code: None, signal: None }
    }
}

/// Non-blocking waitpid. `Ok(Some)` once the child is reaped, `Ok(None)`
/// while it is still running.
fn try_wait_pid(pid: u32) -> Option<ExitReport> {
    let mut status: libc::c_int = 0;
    // SAFETY: waitpid with WNOHANG on a child we forked.
    let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if ret > 0 {
        if libc::WIFEXITED(status) {
            Some(ExitReport { exit_code: Some(libc::WEXITSTATUS(status)), signal: None })
        } else if libc::WIFSIGNALED(status) {
            Some(ExitReport { exit_code: None, signal: Some(libc::WTERMSIG(status)) })
        } else {
            Some(ExitReport::unknown())
        }
    } else if ret == 0 {
        None
    } else {
        // ECHILD: someone else reaped it. Report what we can.
        Some(ExitReport::unknown())
    }
}

// ---------------------------------------------------------------------------
// PTY plumbing
// ---------------------------------------------------------------------------

mod pty {
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// Open a master/slave pair via `openpty(3)`.
    pub fn openpty() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut master_raw: RawFd = -1;
        let mut slave_raw: RawFd = -1;

        // SAFETY: out-pointers are valid; name/termios/winsize may be null.
        let ret = unsafe {
            libc::openpty(
                &mut master_raw,
                &mut slave_raw,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: openpty returned valid fds on success.
        let master = unsafe { OwnedFd::from_raw_fd(master_raw) };
        let slave = unsafe { OwnedFd::from_raw_fd(slave_raw) };
        Ok((master, slave))
    }

    /// Apply a window size to a PTY master fd.
    pub fn set_winsize(fd: RawFd, cols: u16, rows: u16) -> io::Result<()> {
        let ws = libc::winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ with a valid winsize pointer.
        let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: plain fcntl flag manipulation on an owned fd.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Async wrapper around the PTY master, driven by tokio's `AsyncFd`.
    pub struct Master {
        inner: tokio::io::unix::AsyncFd<OwnedFd>,
    }

    impl Master {
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(fd.as_raw_fd())?;
            Ok(Self { inner: tokio::io::unix::AsyncFd::new(fd)? })
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.inner.get_ref().as_raw_fd()
        }

        /// Read once the fd is ready. Returns `Ok(0)` at EOF — including
        /// EIO, which the kernel reports once the slave side is closed.
        pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.inner.readable().await?;
                match guard.try_io(|inner| {
                    let fd = inner.get_ref().as_raw_fd();
                    // SAFETY: buf is valid for buf.len() bytes.
                    let n = unsafe {
                        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
                }) {
                    Ok(Ok(n)) => return Ok(n),
                    Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
        }

        /// Write all of `data` to the master (the child's terminal input).
        pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
            let mut offset = 0;
            while offset < data.len() {
                let mut guard = self.inner.writable().await?;
                match guard.try_io(|inner| {
                    let fd = inner.get_ref().as_raw_fd();
                    let rest = &data[offset..];
                    // SAFETY: rest is valid for rest.len() bytes.
                    let n = unsafe {
                        libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len())
                    };
                    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
                }) {
                    Ok(Ok(n)) => offset += n,
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
            Ok(())
        }
    }
}

/// Geometry and TERM for a PTY allocation.
#[derive(Debug, Clone)]
struct PtySpec {
    cols: u16,
    rows: u16,
    term: String,
}

impl PtySpec {
    fn from_params(params: &Value) -> Option<Self> {
        let map = field(params, "pty")?;
        map.as_map()?;
        Some(Self {
            cols: opt_u64_param(map, "cols").and_then(|v| u16::try_from(v).ok()).unwrap_or(80),
            rows: opt_u64_param(map, "rows").and_then(|v| u16::try_from(v).ok()).unwrap_or(24),
            term: opt_str_param(map, "term").unwrap_or("dumb").to_owned(),
        })
    }
}

/// Allocate a PTY, fork, and exec the child with the slave as its
/// controlling terminal.
///
/// All raw-pointer work is confined to this synchronous function so that
/// no non-`Send` types live across an await point. On success returns the
/// master fd and the child pid.
fn fork_pty(
    cmd: &str,
    args: &[String],
    cwd: Option<&str>,
    env: &[(String, String)],
    pty_spec: &PtySpec,
) -> Result<(std::os::unix::io::OwnedFd, u32), RpcError> {
    use std::os::unix::io::AsRawFd;

    let spawn_err =
        |msg: String| RpcError::new(error_code::PROCESS_FAILURE, format!("`{cmd}`: {msg}"));

    let (master_fd, slave_fd) =
        pty::openpty().map_err(|e| spawn_err(format!("failed to open PTY: {e}")))?;

    let master_raw = master_fd.as_raw_fd();
    let slave_raw = slave_fd.as_raw_fd();

    pty::set_winsize(master_raw, pty_spec.cols, pty_spec.rows)
        .map_err(|e| spawn_err(format!("failed to set PTY window size: {e}")))?;

    let c_program = std::ffi::CString::new(cmd)
        .map_err(|_| RpcError::invalid_params("cmd contains an interior NUL byte"))?;

    let mut c_args = vec![c_program.clone()];
    for arg in args {
        c_args.push(
            std::ffi::CString::new(arg.as_str())
                .map_err(|_| RpcError::invalid_params("argument contains an interior NUL byte"))?,
        );
    }
    let c_arg_ptrs: Vec<*const libc::c_char> =
        c_args.iter().map(|s| s.as_ptr()).chain(std::iter::once(std::ptr::null())).collect();

    let mut c_env: Vec<std::ffi::CString> = env
        .iter()
        .filter_map(|(k, v)| std::ffi::CString::new(format!("{k}={v}")).ok())
        .collect();
    if let Ok(term) = std::ffi::CString::new(format!("TERM={}", pty_spec.term)) {
        c_env.push(term);
    }

    let c_cwd = cwd.and_then(|d| std::ffi::CString::new(d).ok());

    // SAFETY: standard fork/exec dance. The child only calls async-signal-
    // safe functions before execvp.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(spawn_err(format!("fork failed: {}", std::io::Error::last_os_error())));
    }

    if pid == 0 {
        // ---- Child ----
        unsafe {
            libc::setsid();
            libc::ioctl(slave_raw, libc::TIOCSCTTY, 0);

            libc::dup2(slave_raw, libc::STDIN_FILENO);
            libc::dup2(slave_raw, libc::STDOUT_FILENO);
            libc::dup2(slave_raw, libc::STDERR_FILENO);

            if slave_raw > libc::STDERR_FILENO {
                libc::close(slave_raw);
            }
            libc::close(master_raw);

            if let Some(ref dir) = c_cwd {
                libc::chdir(dir.as_ptr());
            }
            for var in &c_env {
                libc::putenv(var.as_ptr() as *mut libc::c_char);
            }

            libc::execvp(c_program.as_ptr(), c_arg_ptrs.as_ptr());
            libc::_exit(127);
        }
    }

    // ---- Parent ----
    drop(slave_fd);
    Ok((master_fd, pid as u32))
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

/// Where a child's stdin bytes go.
#[derive(Clone)]
enum StdinSink {
    /// Ordinary pipe. `None` after the client closed it.
    Pipe(Arc<tokio::sync::Mutex<Option<tokio::process::ChildStdin>>>),
    /// PTY master (terminal input).
    Pty(Arc<pty::Master>),
    /// The process was started without a streamed stdin.
    Detached,
}

/// Bookkeeping for one live child, RUNNING or EXITING.
struct ProcessEntry {
    stdin: StdinSink,
    pty: Option<Arc<pty::Master>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

/// Maps OS pids to live children. Critical sections are lookups and
/// insert/remove only; no I/O happens under the lock.
pub struct ProcessTable {
    inner: Mutex<HashMap<u32, ProcessEntry>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn insert(&self, pid: u32, entry: ProcessEntry) {
        self.inner.lock().unwrap().insert(pid, entry);
    }

    fn remove(&self, pid: u32) {
        self.inner.lock().unwrap().remove(&pid);
    }

    /// Clone out what an operation needs, without holding the lock.
    fn lookup(&self, pid: u32) -> Option<(StdinSink, Option<Arc<pty::Master>>, watch::Receiver<Option<ExitReport>>)> {
        let table = self.inner.lock().unwrap();
        table.get(&pid).map(|e| (e.stdin.clone(), e.pty.clone(), e.exit_rx.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Teardown: SIGTERM every live child and give the reapers up to
    /// `grace` to drain and emit their exit notifications.
    pub async fn shutdown(&self, grace: Duration) {
        let pids: Vec<u32> = self.inner.lock().unwrap().keys().copied().collect();
        for pid in pids {
            let _ = send_signal(pid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Notification helpers
// ---------------------------------------------------------------------------

fn emit_output(events: &EventSink, pid: u32, stream: &str, data: Vec<u8>) {
    events.emit(
        "process.output",
        vec![
            kv("pid", Value::Integer(pid.into())),
            kv("stream", Value::String(stream.into())),
            kv("data", Value::Binary(data)),
        ],
    );
}

fn emit_exit(events: &EventSink, pid: u32, report: ExitReport) {
    let mut fields = vec![
        kv("pid", Value::Integer(pid.into())),
        kv(
            "exit_code",
            match report.exit_code {
                Some(code) => Value::Integer(code.into()),
                None => Value::Nil,
            },
        ),
    ];
    if let Some(sig) = report.signal {
        fields.push(kv("signal", Value::Integer(sig.into())));
    }
    events.emit("process.exit", fields);
}

/// Drain one piped stream into `process.output` fragments until EOF.
fn spawn_pipe_drainer<R>(
    source: R,
    pid: u32,
    stream: &'static str,
    events: EventSink,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;

    let mut source = source;
    tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_FRAGMENT];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => emit_output(&events, pid, stream, buf[..n].to_vec()),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// RPC method handlers
// ---------------------------------------------------------------------------

/// `process.start` — spawn a long-lived child and stream its output.
///
/// Params: `{ cmd, args?, cwd?, env?, pty?: { cols, rows, term }, stdin_stream? }`
///
/// Result: `{ pid }` — the OS pid, used by all other `process.*` methods.
pub async fn start(params: &Value, table: &Arc<ProcessTable>, events: &EventSink) -> HandlerResult {
    let cmd = str_param(params, "cmd")?.to_owned();
    let args: Vec<String> = str_array_param(params, "args")
        .map(|v| v.into_iter().map(str::to_owned).collect())
        .unwrap_or_default();
    let cwd = opt_str_param(params, "cwd").map(str::to_owned);
    let env = env_param(params, "env").unwrap_or_default();
    let stdin_stream = opt_bool_param(params, "stdin_stream").unwrap_or(false);

    if let Some(pty_spec) = PtySpec::from_params(params) {
        start_pty(cmd, args, cwd, env, pty_spec, table, events)
    } else {
        start_piped(cmd, args, cwd, env, stdin_stream, table, events)
    }
}

fn start_piped(
    cmd_name: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    stdin_stream: bool,
    table: &Arc<ProcessTable>,
    events: &EventSink,
) -> HandlerResult {
    let mut cmd = Command::new(&cmd_name);
    cmd.args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin_stream { Stdio::piped() } else { Stdio::null() });

    if let Some(dir) = &cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|e| {
        RpcError::new(error_code::PROCESS_FAILURE, format!("failed to spawn `{cmd_name}`: {e}"))
    })?;

    let Some(pid) = child.id() else {
        return Err(RpcError::new(
            error_code::PROCESS_FAILURE,
            format!("`{cmd_name}` exited before it could be registered"),
        ));
    };

    let stdin = match child.stdin.take() {
        Some(s) => StdinSink::Pipe(Arc::new(tokio::sync::Mutex::new(Some(s)))),
        None => StdinSink::Detached,
    };

    let mut drainers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        drainers.push(spawn_pipe_drainer(out, pid, "stdout", events.clone()));
    }
    if let Some(err) = child.stderr.take() {
        drainers.push(spawn_pipe_drainer(err, pid, "stderr", events.clone()));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    table.insert(pid, ProcessEntry { stdin, pty: None, exit_rx });

    // Reaper: wait for the child, let the drainers flush the tail of the
    // output, then announce the exit and forget the pid.
    let table = Arc::clone(table);
    let events = events.clone();
    tokio::spawn(async move {
        let report = match child.wait().await {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => {
                tracing::error!(pid, error = %e, "wait failed");
                ExitReport::unknown()
            }
        };

        for d in drainers {
            let _ = d.await;
        }

        table.remove(pid);
        emit_exit(&events, pid, report);
        let _ = exit_tx.send(Some(report));
    });

    Ok(Value::Map(vec![kv("pid", Value::Integer(pid.into()))]))
}

fn start_pty(
    cmd_name: String,
    args: Vec<String>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    pty_spec: PtySpec,
    table: &Arc<ProcessTable>,
    events: &EventSink,
) -> HandlerResult {
    let (master_fd, pid) = fork_pty(&cmd_name, &args, cwd.as_deref(), &env, &pty_spec)?;

    let master = match pty::Master::new(master_fd) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            // Cannot talk to the child; don't leak it.
            let _ = send_signal(pid, libc::SIGKILL);
            let _ = try_wait_pid(pid);
            return Err(RpcError::new(
                error_code::PROCESS_FAILURE,
                format!("failed to set up PTY master: {e}"),
            ));
        }
    };

    let (exit_tx, exit_rx) = watch::channel(None);
    table.insert(
        pid,
        ProcessEntry {
            stdin: StdinSink::Pty(Arc::clone(&master)),
            pty: Some(Arc::clone(&master)),
            exit_rx,
        },
    );

    // Combined drainer + reaper: a PTY has a single output stream, and EOF
    // on the master means the child side is gone.
    let table = Arc::clone(table);
    let events = events.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_FRAGMENT];
        loop {
            match master.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => emit_output(&events, pid, "pty", buf[..n].to_vec()),
                Err(e) => {
                    tracing::debug!(pid, error = %e, "pty read error");
                    break;
                }
            }
        }

        let report = loop {
            if let Some(report) = try_wait_pid(pid) {
                break report;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        table.remove(pid);
        emit_exit(&events, pid, report);
        let _ = exit_tx.send(Some(report));
    });

    Ok(Value::Map(vec![kv("pid", Value::Integer(pid.into()))]))
}

/// `process.write_stdin` — write to a child's stdin.
///
/// Params: `{ pid, data: bytes, close: bool }`
///
/// `close` delivers EOF by dropping the pipe half; for a PTY child it is a
/// no-op (a terminal has no out-of-band EOF).
pub async fn write_stdin(params: &Value, table: &Arc<ProcessTable>) -> HandlerResult {
    let pid = u64_param(params, "pid")? as u32;
    let data = bin_param(params, "data")?;
    let close = opt_bool_param(params, "close").unwrap_or(false);

    let Some((sink, _, exit_rx)) = table.lookup(pid) else {
        return Err(no_such_process(pid));
    };
    if exit_rx.borrow().is_some() {
        return Err(no_such_process(pid));
    }

    match sink {
        StdinSink::Pipe(slot) => {
            let mut slot = slot.lock().await;
            let Some(stdin) = slot.as_mut() else {
                return Err(RpcError::new(
                    error_code::PROCESS_FAILURE,
                    format!("stdin already closed for pid {pid}"),
                ));
            };
            stdin.write_all(data).await.map_err(|e| {
                RpcError::new(
                    error_code::PROCESS_FAILURE,
                    format!("failed to write stdin of pid {pid}: {e}"),
                )
            })?;
            stdin.flush().await.map_err(|e| {
                RpcError::new(
                    error_code::PROCESS_FAILURE,
                    format!("failed to flush stdin of pid {pid}: {e}"),
                )
            })?;
            if close {
                slot.take();
            }
        }
        StdinSink::Pty(master) => {
            master.write_all(data).await.map_err(|e| {
                RpcError::new(
                    error_code::PROCESS_FAILURE,
                    format!("failed to write PTY of pid {pid}: {e}"),
                )
            })?;
        }
        StdinSink::Detached => {
            return Err(RpcError::new(
                error_code::PROCESS_FAILURE,
                format!("pid {pid} was started without a streamed stdin"),
            ));
        }
    }

    Ok(Value::Nil)
}

/// `process.signal` — deliver a signal by name or number.
///
/// Params: `{ pid, signal }`
pub async fn signal(params: &Value, table: &Arc<ProcessTable>) -> HandlerResult {
    let pid = u64_param(params, "pid")? as u32;
    let sig = signal_from_value(
        field(params, "signal").ok_or_else(|| RpcError::invalid_params("missing parameter: signal"))?,
    )?;

    let Some((_, _, exit_rx)) = table.lookup(pid) else {
        return Err(no_such_process(pid));
    };
    if exit_rx.borrow().is_some() {
        return Err(no_such_process(pid));
    }

    send_signal(pid, sig)?;
    Ok(Value::Nil)
}

/// `process.resize_pty` — change a PTY child's window size.
///
/// Params: `{ pid, cols, rows }`
///
/// The new size is applied to the master via TIOCSWINSZ and announced to
/// the child's session with SIGWINCH.
pub async fn resize_pty(params: &Value, table: &Arc<ProcessTable>) -> HandlerResult {
    let pid = u64_param(params, "pid")? as u32;
    let cols = u16_param(params, "cols")?;
    let rows = u16_param(params, "rows")?;

    let Some((_, pty, exit_rx)) = table.lookup(pid) else {
        return Err(no_such_process(pid));
    };
    if exit_rx.borrow().is_some() {
        return Err(no_such_process(pid));
    }
    let Some(master) = pty else {
        return Err(RpcError::new(error_code::NOT_A_PTY, format!("pid {pid} has no PTY")));
    };

    pty::set_winsize(master.as_raw_fd(), cols, rows).map_err(|e| {
        RpcError::new(error_code::PROCESS_FAILURE, format!("failed to resize PTY: {e}"))
    })?;

    // The child called setsid, so its process group id equals its pid.
    // SAFETY: signalling the child's process group.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGWINCH);
    }

    Ok(Value::Nil)
}

/// `process.stop` — signal a child and wait for it to go away.
///
/// Params: `{ pid, signal?, timeout_ms? }`
///
/// Sends `signal` (default SIGTERM), waits up to `timeout_ms` (default
/// 5000) for the exit, escalates to SIGKILL if needed, and returns the
/// observed `{ exit_code, signal? }`.
pub async fn stop(params: &Value, table: &Arc<ProcessTable>) -> HandlerResult {
    let pid = u64_param(params, "pid")? as u32;
    let sig = match field(params, "signal") {
        Some(v) => signal_from_value(v)?,
        None => libc::SIGTERM,
    };
    let timeout = opt_u64_param(params, "timeout_ms")
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_STOP_TIMEOUT);

    let Some((_, _, mut exit_rx)) = table.lookup(pid) else {
        return Err(no_such_process(pid));
    };
    if exit_rx.borrow().is_some() {
        return Err(no_such_process(pid));
    }

    // The child may win the race and exit before the signal lands; that is
    // still a successful stop.
    let _ = send_signal(pid, sig);

    let report = match wait_exit(&mut exit_rx, timeout).await {
        Some(report) => report,
        None => {
            let _ = send_signal(pid, libc::SIGKILL);
            // SIGKILL cannot be caught; the reaper will observe it shortly.
            wait_exit(&mut exit_rx, DEFAULT_STOP_TIMEOUT)
                .await
                .unwrap_or_else(ExitReport::unknown)
        }
    };

    let mut fields = vec![kv(
        "exit_code",
        match report.exit_code {
            Some(code) => Value::Integer(code.into()),
            None => Value::Nil,
        },
    )];
    if let Some(sig) = report.signal {
        fields.push(kv("signal", Value::Integer(sig.into())));
    }
    Ok(Value::Map(fields))
}

/// Wait for the reaper's report, bounded by `limit`.
async fn wait_exit(
    rx: &mut watch::Receiver<Option<ExitReport>>,
    limit: Duration,
) -> Option<ExitReport> {
    tokio::time::timeout(limit, async {
        loop {
            if let Some(report) = *rx.borrow() {
                return report;
            }
            if rx.changed().await.is_err() {
                return ExitReport::unknown();
            }
        }
    })
    .await
    .ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;
    use tokio::sync::mpsc;

    fn make_params(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| kv(k, v)).collect())
    }

    fn get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
        value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    struct Harness {
        table: Arc<ProcessTable>,
        events: EventSink,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self { table: Arc::new(ProcessTable::new()), events: EventSink::new(tx), rx }
        }

        async fn next_event(&mut self) -> Value {
            let payload = tokio::time::timeout(Duration::from_secs(10), self.rx.recv())
                .await
                .expect("timed out waiting for a notification")
                .expect("event channel closed");
            rmp_serde::from_slice(&payload).unwrap()
        }

        /// Collect output fragments until the exit notification for `pid`,
        /// returning (concatenated output, exit event).
        async fn drain_until_exit(&mut self, pid: u32) -> (Vec<u8>, Value) {
            let mut output = Vec::new();
            loop {
                let event = self.next_event().await;
                let kind = get(&event, "event").unwrap().as_str().unwrap().to_owned();
                let event_pid = get(&event, "pid").unwrap().as_u64().unwrap() as u32;
                if event_pid != pid {
                    continue;
                }
                match kind.as_str() {
                    "process.output" => {
                        output.extend_from_slice(get(&event, "data").unwrap().as_slice().unwrap());
                    }
                    "process.exit" => return (output, event),
                    other => panic!("unexpected event {other}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn start_streams_output_then_exit() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("echo".into())),
            ("args", Value::Array(vec![Value::String("streamed".into())])),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let (output, exit) = h.drain_until_exit(pid).await;
        assert_eq!(String::from_utf8_lossy(&output), "streamed\n");
        assert_eq!(get(&exit, "exit_code").unwrap().as_i64(), Some(0));

        // The pid is gone afterwards.
        assert!(h.table.is_empty());
        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("data", Value::Binary(b"late".to_vec())),
        ]);
        let err = write_stdin(&params, &h.table).await.unwrap_err();
        assert_eq!(err.code, error_code::NO_SUCH_PROCESS);
    }

    #[tokio::test]
    async fn stderr_is_a_separate_stream() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("sh".into())),
            (
                "args",
                Value::Array(vec![
                    Value::String("-c".into()),
                    Value::String("echo err >&2".into()),
                ]),
            ),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let mut saw_stderr = false;
        loop {
            let event = h.next_event().await;
            match get(&event, "event").unwrap().as_str().unwrap() {
                "process.output" => {
                    if get(&event, "stream").unwrap().as_str() == Some("stderr") {
                        let data = get(&event, "data").unwrap().as_slice().unwrap();
                        assert_eq!(String::from_utf8_lossy(data), "err\n");
                        saw_stderr = true;
                    }
                }
                "process.exit" => break,
                _ => {}
            }
        }
        assert!(saw_stderr, "no stderr fragment before exit");
        let _ = pid;
    }

    #[tokio::test]
    async fn write_stdin_then_close_reaches_child() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("cat".into())),
            ("stdin_stream", Value::Boolean(true)),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("data", Value::Binary(b"hello from the editor\n".to_vec())),
            ("close", Value::Boolean(true)),
        ]);
        write_stdin(&params, &h.table).await.unwrap();

        let (output, exit) = h.drain_until_exit(pid).await;
        assert_eq!(String::from_utf8_lossy(&output), "hello from the editor\n");
        assert_eq!(get(&exit, "exit_code").unwrap().as_i64(), Some(0));
    }

    #[tokio::test]
    async fn signal_by_name_terminates() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("sleep".into())),
            ("args", Value::Array(vec![Value::String("30".into())])),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("signal", Value::String("SIGTERM".into())),
        ]);
        signal(&params, &h.table).await.unwrap();

        let (_, exit) = h.drain_until_exit(pid).await;
        assert!(get(&exit, "exit_code").unwrap().is_nil());
        assert_eq!(get(&exit, "signal").unwrap().as_i64(), Some(libc::SIGTERM as i64));
    }

    #[tokio::test]
    async fn stop_returns_observed_exit() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("sleep".into())),
            ("args", Value::Array(vec![Value::String("30".into())])),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![("pid", Value::Integer(pid.into()))]);
        let result = stop(&params, &h.table).await.unwrap();

        assert!(get(&result, "exit_code").unwrap().is_nil());
        assert_eq!(get(&result, "signal").unwrap().as_i64(), Some(libc::SIGTERM as i64));

        // Exit notification was emitted as well.
        let (_, exit) = h.drain_until_exit(pid).await;
        assert_eq!(get(&exit, "signal").unwrap().as_i64(), Some(libc::SIGTERM as i64));
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_pid_fail() {
        let h = Harness::new();

        let params = make_params(vec![("pid", Value::Integer(999_999_999u64.into()))]);
        let err = stop(&params, &h.table).await.unwrap_err();
        assert_eq!(err.code, error_code::NO_SUCH_PROCESS);

        let params = make_params(vec![
            ("pid", Value::Integer(999_999_999u64.into())),
            ("signal", Value::Integer(9.into())),
        ]);
        let err = signal(&params, &h.table).await.unwrap_err();
        assert_eq!(err.code, error_code::NO_SUCH_PROCESS);
    }

    #[tokio::test]
    async fn resize_on_pipe_process_is_not_a_pty() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("sleep".into())),
            ("args", Value::Array(vec![Value::String("5".into())])),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("cols", Value::Integer(100.into())),
            ("rows", Value::Integer(40.into())),
        ]);
        let err = resize_pty(&params, &h.table).await.unwrap_err();
        assert_eq!(err.code, error_code::NOT_A_PTY);

        let params = make_params(vec![("pid", Value::Integer(pid.into()))]);
        stop(&params, &h.table).await.unwrap();
        let _ = h.drain_until_exit(pid).await;
    }

    #[tokio::test]
    async fn pty_child_sees_requested_geometry() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("stty".into())),
            ("args", Value::Array(vec![Value::String("size".into())])),
            (
                "pty",
                Value::Map(vec![
                    kv("cols", Value::Integer(120.into())),
                    kv("rows", Value::Integer(40.into())),
                    kv("term", Value::String("xterm".into())),
                ]),
            ),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let (output, exit) = h.drain_until_exit(pid).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("40 120"), "stty reported: {text:?}");
        assert_eq!(get(&exit, "exit_code").unwrap().as_i64(), Some(0));
    }

    #[tokio::test]
    async fn pty_resize_is_observed_by_child() {
        let mut h = Harness::new();

        // The child sleeps past the resize, then reports its window size.
        let params = make_params(vec![
            ("cmd", Value::String("sh".into())),
            (
                "args",
                Value::Array(vec![
                    Value::String("-c".into()),
                    Value::String("sleep 1; stty size".into()),
                ]),
            ),
            (
                "pty",
                Value::Map(vec![
                    kv("cols", Value::Integer(80.into())),
                    kv("rows", Value::Integer(24.into())),
                ]),
            ),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("cols", Value::Integer(100.into())),
            ("rows", Value::Integer(50.into())),
        ]);
        resize_pty(&params, &h.table).await.unwrap();

        let (output, _) = h.drain_until_exit(pid).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("50 100"), "stty reported: {text:?}");
    }

    #[tokio::test]
    async fn pty_echoes_written_input() {
        let mut h = Harness::new();

        let params = make_params(vec![
            ("cmd", Value::String("cat".into())),
            ("pty", Value::Map(vec![])),
        ]);
        let result = start(&params, &h.table, &h.events).await.unwrap();
        let pid = get(&result, "pid").unwrap().as_u64().unwrap() as u32;

        let params = make_params(vec![
            ("pid", Value::Integer(pid.into())),
            ("data", Value::Binary(b"terminal input\n".to_vec())),
        ]);
        write_stdin(&params, &h.table).await.unwrap();

        // Wait for the echoed fragment, then stop the child.
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("terminal input") {
            let event = h.next_event().await;
            if get(&event, "event").unwrap().as_str() == Some("process.output") {
                seen.extend_from_slice(get(&event, "data").unwrap().as_slice().unwrap());
            }
        }

        let params = make_params(vec![("pid", Value::Integer(pid.into()))]);
        stop(&params, &h.table).await.unwrap();
        let _ = h.drain_until_exit(pid).await;
    }

    #[tokio::test]
    async fn shutdown_terminates_everything() {
        let h = Harness::new();

        for _ in 0..3 {
            let params = make_params(vec![
                ("cmd", Value::String("sleep".into())),
                ("args", Value::Array(vec![Value::String("30".into())])),
            ]);
            start(&params, &h.table, &h.events).await.unwrap();
        }
        assert!(!h.table.is_empty());

        h.table.shutdown(Duration::from_secs(5)).await;
        assert!(h.table.is_empty());
    }

    #[test]
    fn signal_name_parsing() {
        assert_eq!(signal_from_value(&Value::String("SIGTERM".into())).unwrap(), libc::SIGTERM);
        assert_eq!(signal_from_value(&Value::String("term".into())).unwrap(), libc::SIGTERM);
        assert_eq!(signal_from_value(&Value::String("KILL".into())).unwrap(), libc::SIGKILL);
        assert_eq!(signal_from_value(&Value::Integer(2.into())).unwrap(), 2);
        assert!(signal_from_value(&Value::String("NOTASIGNAL".into())).is_err());
        assert!(signal_from_value(&Value::Integer(0.into())).is_err());
    }
}
