//! RPC operation handlers.
//!
//! Each submodule implements one category of RPC methods:
//!
//! | Module    | Methods                                                     |
//! |-----------|-------------------------------------------------------------|
//! | `file`    | `file.stat`, `file.exists`, `file.read`, `file.write`,     |
//! |           | `file.delete`, `file.rename`, `file.chmod`, `file.chown`,  |
//! |           | `file.symlink`, `file.readlink`, `file.copy`,              |
//! |           | `file.truename`                                             |
//! | `dir`     | `dir.list`, `dir.create`, `dir.remove`                      |
//! | `system`  | `system.info`, `system.getenv`, `ping`                      |
//! | `process` | `process.run` (one-shot, captured output)                   |
//! | `spawn`   | `process.start`, `process.write_stdin`, `process.signal`,  |
//! |           | `process.resize_pty`, `process.stop` + output streaming    |
//! | `watch`   | `watch.add`, `watch.remove` + change notifications          |
//! | `batch`   | `batch`, `commands.run_parallel`                            |
//!
//! Handlers share a uniform signature: parameters in as a MsgPack map,
//! `Result<Value, RpcError>` out. Stateful categories additionally borrow
//! their table (`ProcessTable`, `WatcherTable`) and the event sink for
//! server-initiated notifications.

pub mod batch;
pub mod dir;
pub mod file;
pub mod process;
pub mod spawn;
pub mod system;
pub mod watch;

pub(crate) mod params {
    //! MsgPack parameter extraction shared by every handler module.

    use rmpv::Value;

    use crate::rpc::RpcError;

    /// Look up a key in a MsgPack map.
    pub fn field<'a>(params: &'a Value, key: &str) -> Option<&'a Value> {
        params
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some(key)))
            .map(|(_, v)| v)
    }

    /// Shorthand for building map entries.
    pub fn kv(key: &str, value: Value) -> (Value, Value) {
        (Value::String(key.into()), value)
    }

    fn missing(key: &str, expected: &str) -> RpcError {
        RpcError::invalid_params(format!("missing or invalid parameter: {key} (expected {expected})"))
    }

    /// Required string parameter.
    pub fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
        field(params, key).and_then(Value::as_str).ok_or_else(|| missing(key, "string"))
    }

    /// Optional string parameter.
    pub fn opt_str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
        field(params, key).and_then(Value::as_str)
    }

    /// Required binary parameter. A MsgPack string is accepted too, so
    /// clients may send text content without wrapping it in `bin`.
    pub fn bin_param<'a>(params: &'a Value, key: &str) -> Result<&'a [u8], RpcError> {
        field(params, key)
            .and_then(|v| v.as_slice().or_else(|| v.as_str().map(str::as_bytes)))
            .ok_or_else(|| missing(key, "binary"))
    }

    /// Optional binary parameter, with the same string leniency.
    pub fn opt_bin_param<'a>(params: &'a Value, key: &str) -> Option<&'a [u8]> {
        field(params, key).and_then(|v| v.as_slice().or_else(|| v.as_str().map(str::as_bytes)))
    }

    /// Required unsigned integer parameter.
    pub fn u64_param(params: &Value, key: &str) -> Result<u64, RpcError> {
        field(params, key).and_then(Value::as_u64).ok_or_else(|| missing(key, "u64"))
    }

    /// Optional unsigned integer parameter.
    pub fn opt_u64_param(params: &Value, key: &str) -> Option<u64> {
        field(params, key).and_then(Value::as_u64)
    }

    /// Required u16 parameter (terminal geometry).
    pub fn u16_param(params: &Value, key: &str) -> Result<u16, RpcError> {
        let val = u64_param(params, key)?;
        u16::try_from(val).map_err(|_| {
            RpcError::invalid_params(format!("parameter '{key}' value {val} out of range for u16"))
        })
    }

    /// Optional boolean parameter.
    pub fn opt_bool_param(params: &Value, key: &str) -> Option<bool> {
        field(params, key).and_then(Value::as_bool)
    }

    /// Optional array-of-strings parameter (command argv).
    pub fn str_array_param<'a>(params: &'a Value, key: &str) -> Option<Vec<&'a str>> {
        field(params, key)
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
    }

    /// Optional string→string map parameter (environment overlays).
    pub fn env_param(params: &Value, key: &str) -> Option<Vec<(String, String)>> {
        field(params, key).and_then(Value::as_map).map(|pairs| {
            pairs
                .iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_owned(), v.as_str()?.to_owned())))
                .collect()
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sample() -> Value {
            Value::Map(vec![
                kv("path", Value::String("/tmp/x".into())),
                kv("data", Value::Binary(vec![1, 2, 3])),
                kv("text", Value::String("abc".into())),
                kv("count", Value::Integer(7.into())),
                kv("flag", Value::Boolean(true)),
            ])
        }

        #[test]
        fn required_string() {
            assert_eq!(str_param(&sample(), "path").unwrap(), "/tmp/x");
            assert!(str_param(&sample(), "absent").is_err());
            assert!(str_param(&sample(), "count").is_err());
        }

        #[test]
        fn binary_accepts_str_payload() {
            assert_eq!(bin_param(&sample(), "data").unwrap(), &[1, 2, 3]);
            assert_eq!(bin_param(&sample(), "text").unwrap(), b"abc");
        }

        #[test]
        fn integers_and_bools() {
            assert_eq!(u64_param(&sample(), "count").unwrap(), 7);
            assert_eq!(opt_bool_param(&sample(), "flag"), Some(true));
            assert_eq!(opt_bool_param(&sample(), "absent"), None);
        }

        #[test]
        fn u16_range_check() {
            let p = Value::Map(vec![kv("cols", Value::Integer(100_000.into()))]);
            assert!(u16_param(&p, "cols").is_err());
        }
    }
}
