//! # meshsync codec
//!
//! Canonical CBOR encoding for meshsync.
//!
//! Replicated row values, vector clocks and bundle manifests are all hashed
//! and compared as raw bytes, so the codec must be deterministic: equal
//! logical inputs produce byte-equal output on every device, regardless of
//! map insertion order or platform.
//!
//! ## Canonical rules
//!
//! - Integers use the shortest encoding
//! - Map keys are sorted by their encoded form (length-first, then bytewise)
//! - Reals always encode as 64-bit doubles; NaN is rejected
//! - No indefinite-length items
//! - Text must be UTF-8
//!
//! The decoder validates all of the above, so a decoded value re-encodes to
//! the exact input bytes.
//!
//! ## Usage
//!
//! ```
//! use meshsync_codec::{decode_value, encode_value, Value};
//!
//! let value = Value::map(vec![
//!     (Value::text("title"), Value::text("groceries")),
//!     (Value::text("done"), Value::Integer(0)),
//! ]);
//! let bytes = encode_value(&value).unwrap();
//! assert_eq!(decode_value(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod row;
mod value;

pub use decoder::{decode_value, Decoder};
pub use encoder::{encode_value, Encoder};
pub use error::{CodecError, CodecResult};
pub use row::{decode_pk, decode_row, encode_pk, encode_row, RowValues};
pub use value::Value;
