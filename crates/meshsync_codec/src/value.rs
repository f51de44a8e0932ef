//! Dynamic CBOR value covering the SQLite scalar domain.

use std::cmp::Ordering;

use crate::encoder::encode_value;

/// A dynamic CBOR value.
///
/// Scalars mirror what a SQLite row can hold (NULL, INTEGER, REAL, TEXT,
/// BLOB); `Bool`, `Array` and `Map` exist for protocol records. `Real`
/// always carries a finite or infinite double — NaN is rejected at encode
/// time, so two equal values always have equal bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer, full i64 range.
    Integer(i64),
    /// 64-bit float (SQLite REAL).
    Real(f64),
    /// Byte string (SQLite BLOB).
    Bytes(Vec<u8>),
    /// UTF-8 text (SQLite TEXT).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Key-value pairs, held in canonical key order.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Creates a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Creates a map value with keys sorted into canonical order.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.canonical_cmp(&b.0));
        Value::Map(pairs)
    }

    /// Compares two values by their canonical encodings.
    ///
    /// Canonical CBOR orders map keys length-first, then bytewise, over the
    /// encoded form. Encoding the operands is the simplest way to get that
    /// exactly right; keys are tiny so the cost is irrelevant.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let a = encode_value(self).unwrap_or_default();
        let b = encode_value(other).unwrap_or_default();
        match a.len().cmp(&b.len()) {
            Ordering::Equal => a.cmp(&b),
            ord => ord,
        }
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the float, if this is one.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the text, if this is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the pairs, if this is a map.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Looks up a text key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}
