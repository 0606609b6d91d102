//! Wire protocol: framing, envelopes, and error codes.
//!
//! ## Wire format
//!
//! All messages are length-prefixed:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ 4 bytes BE u32   │  MessagePack payload      │
//! │ (payload length) │  (Request | Response | …) │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! ## Message types
//!
//! - **Request** (client → server): `{ version: "2.0", id: N, method: "...", params: {...} }`
//! - **Response** (server → client): `{ version: "2.0", id: N, result: ... }` or `{ ..., error: { code, message, data? } }`
//! - **Notification** (server → client): `{ version: "2.0", event: "...", ...fields }` (no `id`)
//!
//! Binary data (file contents, process output) uses MsgPack's native `bin`
//! type — no base64.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Transport-level errors
// ---------------------------------------------------------------------------

/// Errors at the framing / codec layer. These are fatal for the connection
/// except where the dispatcher can recover a request id (see
/// [`decode_request`]).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Well-known error codes sent in [`RpcError`].
pub mod error_code {
    /// The payload could not be decoded as MessagePack.
    pub const PARSE_ERROR: i32 = -32700;
    /// The envelope is not a well-formed request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method name is not recognised.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// The parameters are invalid or missing.
    pub const INVALID_PARAMS: i32 = -32602;
    /// An internal / unexpected error occurred.
    pub const INTERNAL_ERROR: i32 = -32603;

    // Application-defined codes:
    /// The target path was not found.
    pub const NOT_FOUND: i32 = -32001;
    /// Permission denied on the remote filesystem.
    pub const PERMISSION_DENIED: i32 = -32002;
    /// The target already exists.
    pub const ALREADY_EXISTS: i32 = -32003;
    /// The path is not a directory.
    pub const NOT_A_DIRECTORY: i32 = -32004;
    /// The path is a directory.
    pub const IS_A_DIRECTORY: i32 = -32005;
    /// Generic I/O error on the remote filesystem.
    pub const IO_ERROR: i32 = -32006;
    /// A child process could not be spawned or controlled.
    pub const PROCESS_FAILURE: i32 = -32010;
    /// No live process with the given pid.
    pub const NO_SUCH_PROCESS: i32 = -32011;
    /// The pid exists but has no pseudo-terminal attached.
    pub const NOT_A_PTY: i32 = -32012;
    /// A filesystem watch could not be established or removed.
    pub const WATCHER_ERROR: i32 = -32020;
}

// ---------------------------------------------------------------------------
// Protocol-visible error
// ---------------------------------------------------------------------------

/// An error surfaced to the client inside a [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Machine-readable error code (see [`error_code`]).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured context (path, errno, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Result type returned by every RPC handler.
pub type HandlerResult = Result<Value, RpcError>;

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self { code, message: message.into(), data: Some(data) }
    }

    /// Missing or malformed parameter.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_code::INVALID_PARAMS, message)
    }

    /// Map an `std::io::Error` from a filesystem operation to the
    /// application error-code range, attaching the offending path as
    /// structured data.
    pub fn io(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => error_code::NOT_FOUND,
            ErrorKind::PermissionDenied => error_code::PERMISSION_DENIED,
            ErrorKind::AlreadyExists => error_code::ALREADY_EXISTS,
            ErrorKind::NotADirectory => error_code::NOT_A_DIRECTORY,
            ErrorKind::IsADirectory => error_code::IS_A_DIRECTORY,
            _ => error_code::IO_ERROR,
        };

        let mut data = vec![(Value::String("path".into()), Value::String(path.into()))];
        if let Some(errno) = err.raw_os_error() {
            data.push((Value::String("errno".into()), Value::Integer(errno.into())));
        }

        Self::with_data(code, format!("{path}: {err}"), Value::Map(data))
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// A request message sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version — always `"2.0"`.
    pub version: String,
    /// Unique request identifier (client-assigned, echoed in the response).
    pub id: u64,
    /// The RPC method to invoke (e.g. `"file.read"`, `"dir.list"`).
    pub method: String,
    /// Method parameters as a MsgPack map.
    pub params: Value,
}

/// A response from server to client. Carries exactly one of `result` or
/// `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version — always `"2.0"`.
    pub version: String,
    /// Matches the `id` of the originating [`Request`].
    pub id: u64,
    /// The result payload (structure depends on the method).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present only when the operation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self { version: "2.0".into(), id, method: method.into(), params }
    }
}

impl Response {
    /// Create a successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self { version: "2.0".into(), id, result: Some(result), error: None }
    }

    /// Create an error response.
    pub fn err(id: u64, error: RpcError) -> Self {
        Self { version: "2.0".into(), id, result: None, error: Some(error) }
    }

    /// Build a response from a handler's return value.
    pub fn from_result(id: u64, result: HandlerResult) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(error) => Self::err(id, error),
        }
    }
}

/// Build an unsolicited notification envelope. The `event` key is the
/// discriminator; the remaining fields sit flat beside it.
pub fn notification(event: &str, fields: Vec<(Value, Value)>) -> Value {
    let mut entries = Vec::with_capacity(fields.len() + 2);
    entries.push((Value::String("version".into()), Value::String("2.0".into())));
    entries.push((Value::String("event".into()), Value::String(event.into())));
    entries.extend(fields);
    Value::Map(entries)
}

// ---------------------------------------------------------------------------
// Outbound event sink
// ---------------------------------------------------------------------------

/// Handle for emitting server-initiated notifications.
///
/// Clones are handed to process output drainers and watcher callbacks;
/// everything funnels into the single writer task's queue, so notification
/// frames never interleave with responses. Sends after the writer has shut
/// down are silently dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

impl EventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Encode and enqueue one notification.
    pub fn emit(&self, event: &str, fields: Vec<(Value, Value)>) {
        match encode_payload(&notification(event, fields)) {
            Ok(payload) => {
                let _ = self.tx.send(payload);
            }
            Err(e) => tracing::error!(event, error = %e, "failed to encode notification"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request decoding
// ---------------------------------------------------------------------------

/// A payload that failed to decode into a [`Request`]. When `id` is
/// `Some`, the dispatcher answers with an error response; otherwise the
/// connection closes.
#[derive(Debug)]
pub struct DecodeFailure {
    pub id: Option<u64>,
    pub error: RpcError,
}

/// Decode a frame payload into a [`Request`].
///
/// Malformed MsgPack yields `-32700`; a map that decodes but is missing
/// `method` or `id` yields `-32600`. In both cases the request id is
/// recovered when the payload allows it.
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeFailure> {
    let value: Value = match rmp_serde::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            return Err(DecodeFailure {
                id: None,
                error: RpcError::new(error_code::PARSE_ERROR, format!("malformed payload: {e}")),
            });
        }
    };

    let Some(map) = value.as_map() else {
        return Err(DecodeFailure {
            id: None,
            error: RpcError::new(error_code::PARSE_ERROR, "expected a MsgPack map"),
        });
    };

    let find = |key: &str| map.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v);

    let id = find("id").and_then(Value::as_u64);
    let method = find("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), Some(method)) => Ok(Request {
            version: find("version").and_then(Value::as_str).unwrap_or("2.0").to_owned(),
            id,
            method: method.to_owned(),
            params: find("params").cloned().unwrap_or_else(|| Value::Map(vec![])),
        }),
        (id, _) => Err(DecodeFailure {
            id,
            error: RpcError::new(
                error_code::INVALID_REQUEST,
                "envelope is missing `id` or `method`",
            ),
        }),
    }
}

// ---------------------------------------------------------------------------
// Framing — async read / write
// ---------------------------------------------------------------------------

/// Default maximum payload size (64 MiB) to prevent malicious / buggy
/// senders from exhausting memory.
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Read a single length-prefixed payload from `reader`.
///
/// Buffering in `read_exact` makes the framing robust against arbitrary
/// transport chunking: a frame is yielded only once all `4 + len` bytes
/// have arrived. Returns `Err(FrameError::ConnectionClosed)` on clean EOF
/// at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u32,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(FrameError::Protocol("zero-length payload".into()));
    }
    if len > max_payload {
        return Err(FrameError::Protocol(format!(
            "payload too large: {len} bytes (max {max_payload})"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize `msg` with MsgPack, returning the raw payload (no length
/// prefix). Struct fields serialize as string-keyed map entries in
/// declaration order.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Write one payload as a length-prefixed frame and flush. All callers go
/// through the single writer task, so frames never interleave.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
