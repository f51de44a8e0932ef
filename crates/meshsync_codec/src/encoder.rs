//! Canonical CBOR encoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Encodes a value to canonical CBOR bytes (RFC 8949 §4.2.1).
///
/// Integers take the shortest form, map keys are emitted in sorted order,
/// and reals are always 64-bit doubles so the encoding stays injective.
///
/// # Errors
///
/// Returns [`CodecError::NanForbidden`] if the value contains a NaN.
pub fn encode_value(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = Encoder::new();
    encoder.push(value)?;
    Ok(encoder.finish())
}

/// A canonical CBOR encoder over an owned buffer.
pub struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }

    /// Appends one value to the buffer.
    pub fn push(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => {
                self.out.push(0xf6);
                Ok(())
            }
            Value::Bool(b) => {
                self.out.push(if *b { 0xf5 } else { 0xf4 });
                Ok(())
            }
            Value::Integer(n) => {
                self.push_integer(*n);
                Ok(())
            }
            Value::Real(f) => self.push_real(*f),
            Value::Bytes(b) => {
                self.push_header(2, b.len() as u64);
                self.out.extend_from_slice(b);
                Ok(())
            }
            Value::Text(s) => {
                self.push_header(3, s.len() as u64);
                self.out.extend_from_slice(s.as_bytes());
                Ok(())
            }
            Value::Array(items) => {
                self.push_header(4, items.len() as u64);
                for item in items {
                    self.push(item)?;
                }
                Ok(())
            }
            Value::Map(pairs) => self.push_map(pairs),
        }
    }

    /// Consumes the encoder and returns the bytes.
    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    fn push_integer(&mut self, n: i64) {
        if n >= 0 {
            self.push_header(0, n as u64);
        } else {
            // CBOR negative argument is -1 - n; never overflows for i64::MIN.
            self.push_header(1, !(n as u64));
        }
    }

    fn push_real(&mut self, f: f64) -> CodecResult<()> {
        if f.is_nan() {
            return Err(CodecError::NanForbidden);
        }
        self.out.push(0xfb);
        self.out.extend_from_slice(&f.to_be_bytes());
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_header(&mut self, major: u8, arg: u64) {
        let mt = major << 5;
        if arg < 24 {
            self.out.push(mt | (arg as u8));
        } else if arg <= u64::from(u8::MAX) {
            self.out.push(mt | 24);
            self.out.push(arg as u8);
        } else if arg <= u64::from(u16::MAX) {
            self.out.push(mt | 25);
            self.out.extend_from_slice(&(arg as u16).to_be_bytes());
        } else if arg <= u64::from(u32::MAX) {
            self.out.push(mt | 26);
            self.out.extend_from_slice(&(arg as u32).to_be_bytes());
        } else {
            self.out.push(mt | 27);
            self.out.extend_from_slice(&arg.to_be_bytes());
        }
    }

    fn push_map(&mut self, pairs: &[(Value, Value)]) -> CodecResult<()> {
        // Sort by the keys' encoded bytes even if the caller bypassed
        // Value::map; output must be canonical regardless.
        let mut encoded: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            encoded.push((encode_value(key)?, value));
        }
        encoded.sort_by(|a, b| match a.0.len().cmp(&b.0.len()) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            ord => ord,
        });

        self.push_header(5, pairs.len() as u64);
        for (key_bytes, value) in encoded {
            self.out.extend_from_slice(&key_bytes);
            self.push(value)?;
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
