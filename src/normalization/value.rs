//! Lenient accessors for loosely-typed legacy JSON.
use serde_json::Value;

use super::text::normalize_string;

/// First non-blank string-ish value among `keys`. Numbers are rendered so
/// integer ids from the legacy API survive as strings.
pub fn str_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| value_to_string(obj.get(*k)?))
}

pub fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => normalize_string(Some(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Booleans pass through; numbers map to `!= 0`; the usual string spellings
/// are honoured; anything else yields `fallback`.
pub fn to_boolean(v: Option<&Value>, fallback: bool) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(fallback),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => fallback,
        },
        _ => fallback,
    }
}

pub fn bool_field(obj: &Value, keys: &[&str], fallback: bool) -> bool {
    let found = keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()));
    to_boolean(found, fallback)
}

/// Floor of a finite number clamped at zero, otherwise `fallback`.
pub fn to_non_negative_int(v: Option<&Value>, fallback: i64) -> i64 {
    match v.and_then(Value::as_f64) {
        Some(f) if f.is_finite() => (f.floor() as i64).max(0),
        _ => fallback,
    }
}

pub fn int_field(obj: &Value, keys: &[&str], fallback: i64) -> i64 {
    let found = keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()));
    to_non_negative_int(found, fallback)
}

/// Like [`int_field`] but keeps absence distinct from zero.
pub fn opt_int_field(obj: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_f64))
        .filter(|f| f.is_finite())
        .map(|f| (f.floor() as i64).max(0))
}

/// Array under `key`, empty when missing or not an array.
pub fn array_field<'a>(obj: &'a Value, key: &str) -> &'a [Value] {
    obj.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
