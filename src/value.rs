//! Bind values and the coercion policy applied to condition literals.
//!
//! Malformed numeric literals never fail a query. They are replaced by a
//! per-type sentinel so the filter degenerates to one that matches nothing
//! (or only the sentinel), which existing callers rely on.

use crate::error::{QueryError, Result};
use crate::schema::TypeClass;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Replacement for unparsable `Number` literals (`Number.MAX_VALUE`)
pub const NUMBER_SENTINEL: f64 = f64::MAX;
/// Replacement for unparsable or out-of-range 32-bit `Integer` literals
pub const INTEGER_SENTINEL: i64 = -2147483648;
/// Replacement for literals outside the 53-bit safe integer range
pub const BIG_INTEGER_SENTINEL: i64 = -9007199254740991;

const MAX_SAFE_INTEGER: f64 = 9007199254740991.0;

/// A typed value bound to a statement placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    /// Result of a date literal that could not be parsed
    InvalidDate,
    Json(Value),
    Bytes(Vec<u8>),
}

impl Param {
    pub fn from_json(value: &Value) -> Param {
        match value {
            Value::Null => Param::Null,
            Value::Bool(b) => Param::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Param::Int(i),
                None => Param::Float(n.as_f64().unwrap_or(NUMBER_SENTINEL)),
            },
            Value::String(s) => Param::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Param::Json(value.clone()),
        }
    }

    /// JSON rendering, used by the document and key-value backends
    pub fn to_json(&self) -> Value {
        match self {
            Param::Null | Param::InvalidDate => Value::Null,
            Param::Bool(b) => Value::Bool(*b),
            Param::Int(i) => Value::from(*i),
            Param::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Param::Text(s) => Value::String(s.clone()),
            Param::Date(d) => Value::String(d.to_rfc3339()),
            Param::Json(v) => v.clone(),
            Param::Bytes(b) => Value::String(encode_blob(b)),
        }
    }
}

/// A regular-expression literal in a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub source: String,
    pub case_insensitive: bool,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            case_insensitive: false,
        }
    }

    pub fn insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Matching is always case-insensitive unless already flagged.
    pub fn forced_insensitive(&self) -> Pattern {
        Pattern {
            source: self.source.clone(),
            case_insensitive: true,
        }
    }

    pub fn options(&self) -> &'static str {
        if self.case_insensitive {
            "i"
        } else {
            ""
        }
    }
}

/// Coerce a condition literal through the column's declared type
pub fn coerce(type_class: TypeClass, value: &Value) -> Param {
    match (type_class, value) {
        (_, Value::Null) => Param::Null,
        (TypeClass::Number, v) => match to_number(v) {
            Some(n) if n.is_finite() => Param::Float(n),
            _ => Param::Float(NUMBER_SENTINEL),
        },
        (TypeClass::Integer, v) => match to_number(v) {
            Some(n) if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 => {
                Param::Int(n as i64)
            }
            _ => Param::Int(INTEGER_SENTINEL),
        },
        (TypeClass::BigInteger | TypeClass::RecordId, v) => match to_number(v) {
            Some(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => Param::Int(n as i64),
            _ => Param::Int(BIG_INTEGER_SENTINEL),
        },
        (TypeClass::Date, v) => parse_date(v).map(Param::Date).unwrap_or(Param::InvalidDate),
        (TypeClass::Boolean, Value::String(s)) => Param::Bool(s == "true" || s == "1"),
        (TypeClass::Boolean, Value::Number(n)) => Param::Bool(n.as_f64() != Some(0.0)),
        (TypeClass::String | TypeClass::Text, Value::Number(n)) => Param::Text(n.to_string()),
        (TypeClass::String | TypeClass::Text, Value::Bool(b)) => Param::Text(b.to_string()),
        (TypeClass::Vector, Value::Array(items)) => Param::Text(vector_literal(items)),
        (TypeClass::Blob, v) => decode_blob(v).map(Param::Bytes).unwrap_or_else(|_| Param::from_json(v)),
        (_, v) => Param::from_json(v),
    }
}

/// Encode a value being written to a column of the given type
///
/// Unlike condition literals, writes never substitute sentinels: values that
/// do not fit the type are passed through and left to the store to reject.
/// Blob values are the exception: they must decode exactly or the write fails.
pub fn encode_write(type_class: TypeClass, array: bool, value: &Value) -> Result<Param> {
    if value.is_null() {
        return Ok(Param::Null);
    }
    if array {
        return Ok(Param::Json(value.clone()));
    }
    let param = match (type_class, value) {
        (TypeClass::Integer | TypeClass::BigInteger | TypeClass::RecordId, Value::Number(n)) => n
            .as_i64()
            .map(Param::Int)
            .unwrap_or_else(|| Param::from_json(value)),
        (TypeClass::Integer | TypeClass::BigInteger | TypeClass::RecordId, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Param::Int)
            .unwrap_or_else(|_| Param::Text(s.clone())),
        (TypeClass::Number, v) => match to_number(v) {
            Some(n) if n.is_finite() => Param::Float(n),
            _ => Param::from_json(v),
        },
        (TypeClass::Date, v) => parse_date(v).map(Param::Date).unwrap_or(Param::Null),
        (TypeClass::Boolean, v) => match v {
            Value::Bool(b) => Param::Bool(*b),
            other => coerce(TypeClass::Boolean, other),
        },
        (TypeClass::Object, v) => Param::Json(v.clone()),
        (TypeClass::Blob, v) => Param::Bytes(decode_blob(v)?),
        (TypeClass::Vector, Value::Array(items)) => Param::Text(vector_literal(items)),
        (TypeClass::String | TypeClass::Text, v) => coerce(type_class, v),
        (_, v) => Param::from_json(v),
    };
    Ok(param)
}

/// Blob columns are read back as base64 text
pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Inverse of [`encode_blob`]; also accepts an array of byte values
pub fn decode_blob(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::String(s) => BASE64
            .decode(s)
            .map_err(|e| QueryError::Serialization(format!("Blob value is not valid base64: {}", e))),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| QueryError::Serialization(format!("Blob byte out of range: {}", item)))
            })
            .collect(),
        other => Err(QueryError::Serialization(format!("Blob expects base64 text or bytes, got {}", other))),
    }
}

/// Numeric conversion with the permissive string rules of the DSL:
/// surrounding whitespace is ignored and an empty string is zero.
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
            }
        }
        _ => None,
    }
}

pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_f64()?;
            if !millis.is_finite() {
                return None;
            }
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            for format in ["%Y-%m-%d", "%Y/%m/%d"] {
                if let Ok(date) = NaiveDate::parse_from_str(s, format) {
                    return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
                }
            }
            None
        }
        _ => None,
    }
}

/// pgvector text form, e.g. `[1,2,3]`
pub fn vector_literal(items: &[Value]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|v| v.as_f64().map(|f| f.to_string()).unwrap_or_else(|| "0".to_string()))
        .collect();
    format!("[{}]", parts.join(","))
}

/// Escape `%`, `_` and the escape character itself for a LIKE operand
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape regex metacharacters so the operand matches literally
pub fn escape_regex(value: &str) -> String {
    regex::escape(value)
}
