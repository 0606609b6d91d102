//! Adaptive output encoding for captured bytes.
//!
//! File contents and process output cross the wire either as MsgPack text
//! (when the bytes form valid text in a known encoding) or as raw MsgPack
//! `bin` — never base64. The chosen encoding travels alongside the payload
//! so the client can reverse the mapping losslessly:
//!
//! 1. Valid UTF-8 → `("utf-8", str)`
//! 2. Otherwise, when the client hinted at a Latin-1-family locale, each
//!    byte maps 1:1 to U+0000..U+00FF → `("latin-1", str)`
//! 3. Otherwise → `("binary", bin)`, bytes preserved exactly.

use rmpv::Value;

/// Locale hints that select the Latin-1 fallback. Anything else (or no
/// hint) skips straight to the binary representation.
fn is_latin1_hint(hint: &str) -> bool {
    matches!(
        hint.to_ascii_lowercase().as_str(),
        "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1"
    )
}

/// Encode captured bytes as a `{ data, encoding }` MsgPack map.
pub fn encoded_bytes(bytes: Vec<u8>, locale_hint: Option<&str>) -> Value {
    let (data, encoding) = match String::from_utf8(bytes) {
        Ok(text) => (Value::String(text.into()), "utf-8"),
        Err(err) => {
            let bytes = err.into_bytes();
            if locale_hint.is_some_and(is_latin1_hint) {
                let text: String = bytes.iter().map(|&b| b as char).collect();
                (Value::String(text.into()), "latin-1")
            } else {
                (Value::Binary(bytes), "binary")
            }
        }
    };

    Value::Map(vec![
        (Value::String("data".into()), data),
        (Value::String("encoding".into()), Value::String(encoding.into())),
    ])
}
