//! Bundle manifests and content hashing.
//!
//! A bundle is a self-contained file shipped between peers. The container
//! itself (a SQLite database) is written by the engine; this module owns
//! the manifest record and the integrity hash, which must be computable by
//! any implementation from the same bytes.

use meshsync_codec::{encode_value, CodecResult, Value};
use sha2::{Digest, Sha256};

use crate::clock::VectorClock;
use crate::ids::{BundleId, DeviceId};
use crate::operation::Operation;

/// Current bundle container format.
pub const BUNDLE_FORMAT_VERSION: i64 = 1;

/// Per-table schema description carried alongside the operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    /// User table name.
    pub table_name: String,
    /// Table version at generation time.
    pub schema_version: i64,
    /// Column names in declaration order.
    pub columns: Vec<String>,
}

impl SchemaSnapshot {
    /// Encodes the column list to its canonical blob.
    pub fn columns_blob(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::Array(
            self.columns.iter().map(|c| Value::text(c.clone())).collect(),
        ))
    }

    /// Decodes a column-list blob.
    pub fn columns_from_blob(bytes: &[u8]) -> CodecResult<Vec<String>> {
        let value = meshsync_codec::decode_value(bytes)?;
        let items = value
            .as_array()
            .ok_or_else(|| meshsync_codec::CodecError::shape("columns blob is not an array"))?;
        items
            .iter()
            .map(|item| {
                item.as_text().map(str::to_string).ok_or_else(|| {
                    meshsync_codec::CodecError::shape("column name is not text")
                })
            })
            .collect()
    }
}

/// The manifest row of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleManifest {
    /// Unique id of this bundle.
    pub bundle_id: BundleId,
    /// Device that generated the bundle.
    pub source_device_id: DeviceId,
    /// Device the bundle was generated for.
    pub peer_device_id: DeviceId,
    /// Generation wall time, Unix microseconds.
    pub created_at: i64,
    /// Container format version.
    pub format_version: i64,
    /// Number of operations inside.
    pub op_count: i64,
    /// The source's vector clock at generation time.
    pub causal_summary: VectorClock,
    /// SHA-256 over the canonical manifest header and ordered op bytes.
    pub sha256: [u8; 32],
}

impl BundleManifest {
    /// Creates an unsealed manifest (hash zeroed).
    #[must_use]
    pub fn new(
        source_device_id: DeviceId,
        peer_device_id: DeviceId,
        created_at: i64,
        op_count: i64,
        causal_summary: VectorClock,
    ) -> Self {
        Self {
            bundle_id: BundleId::generate(),
            source_device_id,
            peer_device_id,
            created_at,
            format_version: BUNDLE_FORMAT_VERSION,
            op_count,
            causal_summary,
            sha256: [0; 32],
        }
    }

    /// Canonical encoding of everything except the hash itself.
    fn header_bytes(&self) -> CodecResult<Vec<u8>> {
        encode_value(&Value::map(vec![
            (
                Value::text("bundle_id"),
                Value::Bytes(self.bundle_id.as_bytes().to_vec()),
            ),
            (
                Value::text("source_device_id"),
                Value::Bytes(self.source_device_id.as_bytes().to_vec()),
            ),
            (
                Value::text("peer_device_id"),
                Value::Bytes(self.peer_device_id.as_bytes().to_vec()),
            ),
            (Value::text("created_at"), Value::Integer(self.created_at)),
            (
                Value::text("format_version"),
                Value::Integer(self.format_version),
            ),
            (Value::text("op_count"), Value::Integer(self.op_count)),
            (Value::text("causal_summary"), self.causal_summary.to_value()),
        ]))
    }

    /// Computes the content hash for this manifest over the given ops.
    ///
    /// The ops must already be in the global deterministic order; the hash
    /// covers the manifest header followed by each op's canonical bytes.
    pub fn compute_hash(&self, ops: &[Operation]) -> CodecResult<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(self.header_bytes()?);
        for op in ops {
            hasher.update(op.encode()?);
        }
        Ok(hasher.finalize().into())
    }

    /// Fills in the hash from the ordered operations.
    pub fn seal(&mut self, ops: &[Operation]) -> CodecResult<()> {
        self.sha256 = self.compute_hash(ops)?;
        Ok(())
    }

    /// Recomputes the hash and checks it against the stored one.
    pub fn verify(&self, ops: &[Operation]) -> CodecResult<bool> {
        Ok(self.compute_hash(ops)? == self.sha256)
    }
}
