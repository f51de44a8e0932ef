//! The replication unit: one captured row mutation.

use meshsync_codec::{decode_value, encode_value, CodecError, CodecResult, Value};

use crate::clock::{Hlc, VectorClock};
use crate::ids::{DeviceId, OpId};

/// What an operation did to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Row created.
    Insert,
    /// Row changed.
    Update,
    /// Row removed.
    Delete,
    /// Additive schema change (column addition) travelling as an operation.
    SchemaMigration,
}

impl OpType {
    /// Stable text code, also used in the SQL schema's CHECK constraint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::SchemaMigration => "SCHEMA_MIGRATION",
        }
    }

    /// Parses the text code.
    #[must_use]
    pub fn from_str(code: &str) -> Option<Self> {
        match code {
            "INSERT" => Some(OpType::Insert),
            "UPDATE" => Some(OpType::Update),
            "DELETE" => Some(OpType::Delete),
            "SCHEMA_MIGRATION" => Some(OpType::SchemaMigration),
            _ => None,
        }
    }

    /// True for the row-mutating kinds (the ones that can conflict).
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        !matches!(self, OpType::SchemaMigration)
    }
}

/// An immutable record of a single mutation on an opted-in table.
///
/// Once persisted an operation never changes (only the local bookkeeping
/// field `applied_at` is filled in when the op is replayed). The
/// `(device_id, parent_op_id)` pairs form one chain per device.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Globally unique, time-ordered id.
    pub op_id: OpId,
    /// Originating device.
    pub device_id: DeviceId,
    /// Previous op captured by the same device; `None` for its first.
    pub parent_op_id: Option<OpId>,
    /// Snapshot of the originator's clock at capture (self already bumped).
    pub vector_clock: VectorClock,
    /// Hybrid-logical-clock stamp; the total-order tie-break.
    pub hlc: Hlc,
    /// Target user table.
    pub table_name: String,
    /// Kind of mutation.
    pub op_type: OpType,
    /// Canonical primary-key blob.
    pub row_pk: Vec<u8>,
    /// Row image before the mutation (UPDATE, DELETE).
    pub old_values: Option<Vec<u8>>,
    /// Row image after the mutation (INSERT, UPDATE) or migration payload.
    pub new_values: Option<Vec<u8>>,
    /// Version of the target table at capture.
    pub schema_version: i64,
    /// Capture wall time, Unix microseconds.
    pub created_at: i64,
    /// Captured here (true) or imported from a peer (false).
    pub is_local: bool,
    /// When the op was replayed into the user table; `None` until then.
    pub applied_at: Option<i64>,
}

impl Operation {
    /// The originator's own counter inside `vector_clock`.
    ///
    /// Used for delta queries and clock-based dedup: a peer whose clock
    /// already counts this far for the originator has seen the op.
    #[must_use]
    pub fn device_counter(&self) -> u64 {
        self.vector_clock.counter_for(&self.device_id)
    }

    /// Canonical wire encoding.
    ///
    /// Local bookkeeping (`is_local`, `applied_at`) is excluded so the bytes
    /// are identical on every device; bundle hashes are computed over this.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut pairs = vec![
            (
                Value::text("op_id"),
                Value::Bytes(self.op_id.as_bytes().to_vec()),
            ),
            (
                Value::text("device_id"),
                Value::Bytes(self.device_id.as_bytes().to_vec()),
            ),
            (Value::text("vc"), self.vector_clock.to_value()),
            (Value::text("hlc"), Value::text(self.hlc.to_string())),
            (Value::text("table"), Value::text(self.table_name.clone())),
            (Value::text("op_type"), Value::text(self.op_type.as_str())),
            (Value::text("row_pk"), Value::Bytes(self.row_pk.clone())),
            (
                Value::text("schema_version"),
                Value::Integer(self.schema_version),
            ),
            (Value::text("created_at"), Value::Integer(self.created_at)),
        ];

        if let Some(parent) = &self.parent_op_id {
            pairs.push((
                Value::text("parent_op_id"),
                Value::Bytes(parent.as_bytes().to_vec()),
            ));
        }
        if let Some(old) = &self.old_values {
            pairs.push((Value::text("old_values"), Value::Bytes(old.clone())));
        }
        if let Some(new) = &self.new_values {
            pairs.push((Value::text("new_values"), Value::Bytes(new.clone())));
        }

        encode_value(&Value::map(pairs))
    }

    /// Decodes the wire form. The result is marked imported
    /// (`is_local = false`, `applied_at = None`).
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = decode_value(bytes)?;
        if value.as_map().is_none() {
            return Err(CodecError::shape("operation is not a map"));
        }

        let id_field = |name: &str| -> CodecResult<[u8; 16]> {
            value
                .get(name)
                .and_then(Value::as_bytes)
                .and_then(|b| <[u8; 16]>::try_from(b).ok())
                .ok_or_else(|| CodecError::shape(format!("operation missing {name}")))
        };

        let op_id = OpId::from_bytes(id_field("op_id")?);
        let device_id = DeviceId::from_bytes(id_field("device_id")?);
        let parent_op_id = value
            .get("parent_op_id")
            .and_then(Value::as_bytes)
            .and_then(OpId::from_slice);

        let vector_clock = VectorClock::from_value(
            value
                .get("vc")
                .ok_or_else(|| CodecError::shape("operation missing vc"))?,
        )?;

        let hlc = Hlc::parse(
            value
                .get("hlc")
                .and_then(Value::as_text)
                .ok_or_else(|| CodecError::shape("operation missing hlc"))?,
        )?;

        let table_name = value
            .get("table")
            .and_then(Value::as_text)
            .ok_or_else(|| CodecError::shape("operation missing table"))?
            .to_string();

        let op_type = value
            .get("op_type")
            .and_then(Value::as_text)
            .and_then(OpType::from_str)
            .ok_or_else(|| CodecError::shape("operation has invalid op_type"))?;

        let row_pk = value
            .get("row_pk")
            .and_then(Value::as_bytes)
            .ok_or_else(|| CodecError::shape("operation missing row_pk"))?
            .to_vec();

        let schema_version = value
            .get("schema_version")
            .and_then(Value::as_integer)
            .ok_or_else(|| CodecError::shape("operation missing schema_version"))?;

        let created_at = value
            .get("created_at")
            .and_then(Value::as_integer)
            .ok_or_else(|| CodecError::shape("operation missing created_at"))?;

        let old_values = value
            .get("old_values")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);
        let new_values = value
            .get("new_values")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);

        Ok(Self {
            op_id,
            device_id,
            parent_op_id,
            vector_clock,
            hlc,
            table_name,
            op_type,
            row_pk,
            old_values,
            new_values,
            schema_version,
            created_at,
            is_local: false,
            applied_at: None,
        })
    }
}
