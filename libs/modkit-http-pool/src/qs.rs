//! Query-string and form flattening.
//!
//! Any `Serialize` value that serialises to a JSON object is flattened into
//! `key=value` pairs:
//!
//! - nested objects become dotted keys: `{"a":{"b":1}}` → `a.b=1`
//! - sequences repeat the key: `{"ids":[1,2]}` → `ids=1&ids=2`
//! - objects inside sequences recurse with the dotted prefix
//! - `null` values are skipped
//!
//! A top-level string is taken as an already encoded query string. Any other
//! top-level value is rejected with [`HttpError::InvalidQuery`].

use crate::error::HttpError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Flatten `value` into ordered key/value pairs.
///
/// # Errors
///
/// Returns [`HttpError::InvalidQuery`] if `value` is not an object, and
/// [`HttpError::Json`] if it cannot be serialised.
pub fn to_pairs<T: Serialize + ?Sized>(value: &T) -> Result<Vec<(String, String)>, HttpError> {
    pairs_of(&serde_json::to_value(value)?)
}

fn pairs_of(value: &Value) -> Result<Vec<(String, String)>, HttpError> {
    match value {
        Value::Object(map) => {
            let mut pairs = Vec::new();
            flatten_object("", map, &mut pairs);
            Ok(pairs)
        }
        other => Err(HttpError::InvalidQuery(format!(
            "expected an object, got {}",
            kind_of(other)
        ))),
    }
}

/// Serialise `value` into an `application/x-www-form-urlencoded` string.
///
/// # Errors
///
/// See [`to_pairs`]; a top-level string is returned unchanged.
pub fn stringify<T: Serialize + ?Sized>(value: &T) -> Result<String, HttpError> {
    match serde_json::to_value(value)? {
        Value::String(raw) => Ok(raw),
        other => Ok(serde_urlencoded::to_string(pairs_of(&other)?)?),
    }
}

/// Append the serialised `value` to `url`, using `&` if it already has a query.
///
/// # Errors
///
/// See [`stringify`].
pub fn append_to_url<T: Serialize + ?Sized>(url: &str, value: &T) -> Result<String, HttpError> {
    let query = stringify(value)?;
    if query.is_empty() {
        return Ok(url.to_owned());
    }
    let separator = if url.contains('?') {
        if url.ends_with('?') || url.ends_with('&') {
            ""
        } else {
            "&"
        }
    } else {
        "?"
    };
    Ok(format!("{url}{separator}{query}"))
}

fn flatten_object(prefix: &str, map: &Map<String, Value>, out: &mut Vec<(String, String)>) {
    for (key, value) in map {
        flatten_value(&format!("{prefix}{key}"), value, out);
    }
}

fn flatten_value(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => flatten_object(&format!("{key}."), map, out),
        Value::Array(items) => {
            for item in items {
                flatten_value(key, item, out);
            }
        }
        Value::String(s) => out.push((key.to_owned(), s.clone())),
        Value::Bool(b) => out.push((key.to_owned(), b.to_string())),
        Value::Number(n) => out.push((key.to_owned(), n.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "an object",
    }
}
