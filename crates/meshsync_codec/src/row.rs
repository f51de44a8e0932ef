//! Row and primary-key blob helpers.
//!
//! A captured row is stored as one canonical CBOR map keyed by column name;
//! a primary key is a single scalar or, for composite keys, an array. Both
//! forms feed conflict-detection equality checks and bundle hashes, so the
//! bytes must be identical on every device.

use std::collections::BTreeMap;

use crate::decoder::decode_value;
use crate::encoder::encode_value;
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// A decoded column→value row image.
pub type RowValues = BTreeMap<String, Value>;

/// Encodes a row image to its canonical blob.
pub fn encode_row(row: &RowValues) -> CodecResult<Vec<u8>> {
    let pairs = row
        .iter()
        .map(|(column, value)| (Value::text(column.clone()), value.clone()))
        .collect();
    encode_value(&Value::map(pairs))
}

/// Decodes a row blob back into a column→value map.
///
/// # Errors
///
/// Fails if the blob is not a CBOR map with text keys.
pub fn decode_row(bytes: &[u8]) -> CodecResult<RowValues> {
    let value = decode_value(bytes)?;
    let pairs = value
        .as_map()
        .ok_or_else(|| CodecError::shape("row blob is not a map"))?;

    let mut row = RowValues::new();
    for (key, value) in pairs {
        let column = key
            .as_text()
            .ok_or_else(|| CodecError::shape("row column name is not text"))?;
        row.insert(column.to_string(), value.clone());
    }
    Ok(row)
}

/// Encodes a primary-key tuple.
///
/// A single-column key is packed as the bare scalar; composite keys pack as
/// an array in declaration order.
pub fn encode_pk(parts: &[Value]) -> CodecResult<Vec<u8>> {
    match parts {
        [] => Err(CodecError::shape("primary key has no parts")),
        [single] => encode_value(single),
        many => encode_value(&Value::Array(many.to_vec())),
    }
}

/// Decodes a primary-key blob into its component values.
pub fn decode_pk(bytes: &[u8]) -> CodecResult<Vec<Value>> {
    match decode_value(bytes)? {
        Value::Array(parts) if !parts.is_empty() => Ok(parts),
        Value::Array(_) => Err(CodecError::shape("empty primary key")),
        single => Ok(vec![single]),
    }
}
