//! Request bundling.
//!
//! Implements the following RPC methods:
//!
//! | Method                  | Description                                  |
//! |-------------------------|----------------------------------------------|
//! | `batch`                 | Run sub-requests sequentially, never abort   |
//! | `commands.run_parallel` | Run keyed commands concurrently              |
//!
//! `batch` amortises per-request envelope cost: every sub-request is
//! attempted and contributes exactly one slot to the result vector, error
//! or not. `commands.run_parallel` fans a set of one-shot commands out to
//! the process executor, bounded by the configured parallelism, and keys
//! the results by the client-supplied names. Neither primitive is
//! transactional.

use std::sync::Arc;

use rmpv::Value;

use crate::ops::params::{field, kv};
use crate::ops::process::{CommandSpec, run_command};
use crate::rpc::{HandlerResult, RpcError, error_code};
use crate::server::ServerState;

/// Render a handler outcome as one batch result slot:
/// `{ result: … }` or `{ error: { code, message, data? } }`.
fn result_slot(result: HandlerResult) -> Value {
    match result {
        Ok(value) => Value::Map(vec![kv("result", value)]),
        Err(err) => {
            let mut fields = vec![
                kv("code", Value::Integer(err.code.into())),
                kv("message", Value::String(err.message.into())),
            ];
            if let Some(data) = err.data {
                fields.push(kv("data", data));
            }
            Value::Map(vec![kv("error", Value::Map(fields))])
        }
    }
}

/// `batch` — run an ordered vector of sub-requests.
///
/// Params: `{ requests: [ { method, params? }, … ] }`
///
/// Result: `{ results: [ slot, … ] }`, one slot per sub-request in input
/// order. A failing sub-request never elides the ones after it. Nesting
/// the orchestration primitives is rejected per slot.
pub async fn batch(params: &Value, state: &ServerState) -> HandlerResult {
    let requests = field(params, "requests").and_then(Value::as_array).ok_or_else(|| {
        RpcError::invalid_params("missing or invalid parameter: requests (expected array)")
    })?;

    let mut results = Vec::with_capacity(requests.len());

    for request in requests {
        let Some(method) = field(request, "method").and_then(Value::as_str) else {
            results.push(result_slot(Err(RpcError::invalid_params(
                "sub-request is missing `method`",
            ))));
            continue;
        };

        if method == "batch" || method == "commands.run_parallel" {
            results.push(result_slot(Err(RpcError::invalid_params(format!(
                "`{method}` cannot be nested inside a batch"
            )))));
            continue;
        }

        let empty = Value::Map(vec![]);
        let sub_params = field(request, "params").unwrap_or(&empty);

        let outcome = crate::server::dispatch_method(state, method, sub_params).await;
        results.push(result_slot(outcome));
    }

    Ok(Value::Map(vec![kv("results", Value::Array(results))]))
}

/// `commands.run_parallel` — run several one-shot commands concurrently.
///
/// Params: `{ commands: { key: { cmd, args?, cwd?, env? }, … } }`
///
/// Result: `{ results: { key: process.run-result | { error } } }`.
/// Concurrency is bounded by the server's configured parallelism
/// (default: number of CPUs); the response is assembled once every
/// command has finished.
pub async fn run_parallel(params: &Value, state: &ServerState) -> HandlerResult {
    let commands = field(params, "commands").and_then(Value::as_map).ok_or_else(|| {
        RpcError::invalid_params("missing or invalid parameter: commands (expected map)")
    })?;

    let limit = state.config.effective_parallelism();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));

    let mut handles = Vec::with_capacity(commands.len());
    for (key, spec_value) in commands {
        let Some(key) = key.as_str().map(str::to_owned) else {
            return Err(RpcError::invalid_params("command keys must be strings"));
        };

        let spec = CommandSpec::from_params(spec_value);
        let semaphore = Arc::clone(&semaphore);

        handles.push((
            key,
            tokio::spawn(async move {
                // A closed semaphore is impossible here; treat it as fatal.
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                match spec {
                    Ok(spec) => run_command(spec).await,
                    Err(err) => Err(err),
                }
            }),
        ));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RpcError::new(
                error_code::INTERNAL_ERROR,
                format!("command task failed: {e}"),
            )),
        };
        results.push((Value::String(key.into()), result_slot(outcome)));
    }

    Ok(Value::Map(vec![kv("results", Value::Map(results))]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
