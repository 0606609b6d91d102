//! The serve loop: one reader, one writer, a bounded worker pool.
//!
//! ```text
//!            ┌──────────┐   requests    ┌─────────────┐
//!  stdin ───▶│  reader  │──────────────▶│ worker pool │──┐
//!            └──────────┘  (semaphore)  └─────────────┘  │ responses
//!                                                        ▼
//!            ┌──────────┐    mpsc     ┌──────────────────────┐
//!  stdout ◀──│  writer  │◀────────────│ drainers / watchers   │
//!            └──────────┘             │ (notifications)       │
//!                                     └──────────────────────┘
//! ```
//!
//! The reader owns the inbound half: it frames, decodes, and spawns one
//! task per request, with admission bounded by a semaphore (default 16
//! permits). The writer owns the outbound half: responses and
//! notifications are pre-encoded by their producers and funnel through a
//! single mpsc queue, so frames never interleave. Responses to distinct
//! requests are therefore unordered; notifications from one source keep
//! their source order.
//!
//! A panic inside a handler is caught at the task boundary, logged, and
//! turned into an internal-error response for that request alone.
//!
//! ## Teardown
//!
//! On transport EOF, a fatal framing error, or a writer failure: stop
//! admitting requests, SIGTERM and reap every live child, detach all
//! watchers, give pending output up to a second to drain, and return.

use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::ops;
use crate::ops::spawn::ProcessTable;
use crate::ops::watch::WatcherTable;
use crate::rpc::{
    self, EventSink, FrameError, HandlerResult, Request, Response, RpcError, error_code,
};

/// Shared context handed to every handler invocation.
pub struct ServerState {
    pub config: Config,
    pub processes: Arc<ProcessTable>,
    pub watchers: Arc<WatcherTable>,
    pub events: EventSink,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Top-level method dispatch, including the orchestration primitives.
pub async fn dispatch(state: &ServerState, method: &str, params: &Value) -> HandlerResult {
    match method {
        "batch" => ops::batch::batch(params, state).await,
        "commands.run_parallel" => ops::batch::run_parallel(params, state).await,
        _ => dispatch_method(state, method, params).await,
    }
}

/// The static method table for all plain (non-orchestration) operations.
/// The batch engine calls this directly, which is what keeps `batch` from
/// nesting.
pub(crate) async fn dispatch_method(
    state: &ServerState,
    method: &str,
    params: &Value,
) -> HandlerResult {
    match method {
        // -- System -----------------------------------------------------------
        "system.info" => ops::system::info(params).await,
        "system.getenv" => ops::system::getenv(params).await,
        "ping" => ops::system::ping(params).await,

        // -- Files ------------------------------------------------------------
        "file.stat" => ops::file::stat(params).await,
        "file.exists" => ops::file::exists(params).await,
        "file.read" => ops::file::read(params).await,
        "file.write" => ops::file::write(params).await,
        "file.delete" => ops::file::delete(params).await,
        "file.rename" => ops::file::rename(params).await,
        "file.chmod" => ops::file::chmod(params).await,
        "file.chown" => ops::file::chown(params).await,
        "file.symlink" => ops::file::symlink(params).await,
        "file.readlink" => ops::file::readlink(params).await,
        "file.copy" => ops::file::copy(params).await,
        "file.truename" => ops::file::truename(params).await,

        // -- Directories ------------------------------------------------------
        "dir.list" => ops::dir::list(params).await,
        "dir.create" => ops::dir::create(params).await,
        "dir.remove" => ops::dir::remove(params).await,

        // -- Processes --------------------------------------------------------
        "process.run" => ops::process::run(params).await,
        "process.start" => ops::spawn::start(params, &state.processes, &state.events).await,
        "process.write_stdin" => ops::spawn::write_stdin(params, &state.processes).await,
        "process.signal" => ops::spawn::signal(params, &state.processes).await,
        "process.resize_pty" => ops::spawn::resize_pty(params, &state.processes).await,
        "process.stop" => ops::spawn::stop(params, &state.processes).await,

        // -- Watches ----------------------------------------------------------
        "watch.add" => ops::watch::add(params, &state.watchers, &state.events).await,
        "watch.remove" => ops::watch::remove(params, &state.watchers).await,

        _ => Err(RpcError::new(
            error_code::METHOD_NOT_FOUND,
            format!("unknown method: {method}"),
        )),
    }
}

/// Run one request to completion, converting a handler panic into an
/// internal-error response instead of losing the request.
async fn run_handler(state: Arc<ServerState>, request: Request) -> Response {
    let id = request.id;
    let method = request.method.clone();

    let task =
        tokio::spawn(async move { dispatch(&state, &request.method, &request.params).await });

    match task.await {
        Ok(result) => Response::from_result(id, result),
        Err(e) if e.is_panic() => {
            tracing::error!(id, method, "handler panicked");
            Response::err(
                id,
                RpcError::new(error_code::INTERNAL_ERROR, format!("handler for {method} panicked")),
            )
        }
        Err(e) => Response::err(
            id,
            RpcError::new(error_code::INTERNAL_ERROR, format!("handler task failed: {e}")),
        ),
    }
}

// ---------------------------------------------------------------------------
// Reader / writer tasks
// ---------------------------------------------------------------------------

/// Drain the outbound queue onto the transport. Sole writer; returns on
/// queue close (teardown) or write error.
async fn write_loop<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(payload) = rx.recv().await {
        if let Err(e) = rpc::write_frame(&mut writer, &payload).await {
            tracing::error!(error = %e, "transport write failed");
            break;
        }
    }
}

/// Consume the transport until EOF or a fatal error, spawning one worker
/// per request. Admission is bounded by the worker semaphore, so a slow
/// burst of handlers backpressures the reader instead of piling up tasks.
async fn read_loop<R>(reader: R, state: Arc<ServerState>, out_tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let max_payload = state.config.max_payload();
    let workers = Arc::new(tokio::sync::Semaphore::new(state.config.workers.max(1)));
    let mut reader = BufReader::new(reader);

    loop {
        let payload = match rpc::read_frame(&mut reader, max_payload).await {
            Ok(p) => p,
            Err(FrameError::ConnectionClosed) => {
                tracing::info!("transport closed, shutting down");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "fatal transport error, shutting down");
                break;
            }
        };

        let request = match rpc::decode_request(&payload) {
            Ok(r) => r,
            Err(failure) => match failure.id {
                Some(id) => {
                    send_response(&out_tx, Response::err(id, failure.error));
                    continue;
                }
                None => {
                    // No id to answer to; the codec state is untrustworthy.
                    tracing::error!(error = %failure.error.message, "undecodable payload, closing");
                    break;
                }
            },
        };

        let permit = Arc::clone(&workers).acquire_owned().await.expect("semaphore closed");
        let state = Arc::clone(&state);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let response = run_handler(state, request).await;
            send_response(&out_tx, response);
            drop(permit);
        });
    }
}

fn send_response(out_tx: &mpsc::UnboundedSender<Vec<u8>>, response: Response) {
    match rpc::encode_payload(&response) {
        // A send failure means the writer is gone; teardown is underway.
        Ok(payload) => {
            let _ = out_tx.send(payload);
        }
        Err(e) => tracing::error!(id = response.id, error = %e, "failed to encode response"),
    }
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

/// Serve one connection over the given transport halves until it ends,
/// then tear everything down: children signalled and reaped, watchers
/// detached, pending output drained (bounded).
pub async fn serve<R, W>(reader: R, writer: W, config: Config)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let state = Arc::new(ServerState {
        events: EventSink::new(out_tx.clone()),
        processes: Arc::new(ProcessTable::new()),
        watchers: Arc::new(WatcherTable::new()),
        config,
    });

    let mut writer_task = tokio::spawn(write_loop(writer, out_rx));
    let mut writer_done = false;

    tokio::select! {
        () = read_loop(reader, Arc::clone(&state), out_tx.clone()) => {}
        _ = &mut writer_task => {
            writer_done = true;
            tracing::error!("writer terminated, shutting down");
        }
    }

    // Teardown. Children first so their drainers emit final output and
    // exit notifications while the writer may still be draining.
    state.processes.shutdown(Duration::from_secs(1)).await;
    state.watchers.clear();

    // Close the queue: the writer exits once in-flight workers and
    // drainers have dropped their sender clones.
    drop(out_tx);
    drop(state);

    if !writer_done {
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut writer_task).await;
    }
    writer_task.abort();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
