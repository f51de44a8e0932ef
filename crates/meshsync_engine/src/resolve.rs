//! Conflict resolvers.
//!
//! A resolver turns a detected conflict into a decision. The built-in
//! strategies are deterministic across peers — both sides of a conflict
//! compute the same winner from the same pair, so applying a resolution
//! needs no extra round trip. `Manual` always defers; `Custom` wraps a
//! caller-provided function.

use std::fmt;
use std::sync::Arc;

use meshsync_codec::{decode_row, RowValues};
use meshsync_protocol::Operation;

use crate::error::EngineResult;

/// Everything a resolver may look at.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    /// Table holding the contested row.
    pub table_name: String,
    /// Canonical primary-key blob.
    pub row_pk: Vec<u8>,
    /// The operation that currently owns the row locally.
    pub local_op: Operation,
    /// The concurrent incoming operation.
    pub remote_op: Operation,
    /// Decoded image the local op wrote (empty for a delete).
    pub local_values: RowValues,
    /// Decoded image the remote op carries (empty for a delete).
    pub remote_values: RowValues,
    /// The row as it stands right now, if present.
    pub current_row: Option<RowValues>,
}

impl ConflictContext {
    /// Builds a context from the two conflicting operations.
    pub(crate) fn build(
        local_op: Operation,
        remote_op: Operation,
        current_row: Option<RowValues>,
    ) -> EngineResult<Self> {
        let decode = |blob: &Option<Vec<u8>>| -> EngineResult<RowValues> {
            Ok(match blob {
                Some(bytes) => decode_row(bytes)?,
                None => RowValues::new(),
            })
        };
        Ok(Self {
            table_name: remote_op.table_name.clone(),
            row_pk: remote_op.row_pk.clone(),
            local_values: decode(&local_op.new_values)?,
            remote_values: decode(&remote_op.new_values)?,
            local_op,
            remote_op,
            current_row,
        })
    }
}

/// A resolver's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local row as it is; the local op wins.
    KeepLocal,
    /// Replay the remote op; it wins.
    TakeRemote,
    /// Write this merged image to the row; no single winner.
    Merge(RowValues),
    /// No decision; leave the conflict for an operator.
    Defer,
}

/// Pluggable resolution strategies.
#[derive(Clone)]
pub enum ResolverStrategy {
    /// Winner is the op with the greater `(hlc, device_id)` pair.
    LastWriteWins,
    /// Column-wise merge; each column comes from the op with the greater
    /// HLC, `prefer_local` breaking exact ties. Falls back to
    /// last-write-wins when either side is a delete.
    FieldMerge {
        /// Tie-break direction for columns both sides changed identically
        /// timed.
        prefer_local: bool,
    },
    /// Never decides; every conflict is left for an operator.
    Manual,
    /// Caller-supplied resolution function.
    Custom(Arc<dyn Fn(&ConflictContext) -> Resolution + Send + Sync>),
}

impl ResolverStrategy {
    /// Strategy name recorded in `resolved_by`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ResolverStrategy::LastWriteWins => "last_write_wins",
            ResolverStrategy::FieldMerge { .. } => "field_merge",
            ResolverStrategy::Manual => "manual",
            ResolverStrategy::Custom(_) => "custom",
        }
    }

    /// Runs the strategy over a conflict.
    #[must_use]
    pub fn resolve(&self, ctx: &ConflictContext) -> Resolution {
        match self {
            ResolverStrategy::LastWriteWins => lww(ctx),
            ResolverStrategy::FieldMerge { prefer_local } => field_merge(ctx, *prefer_local),
            ResolverStrategy::Manual => Resolution::Defer,
            ResolverStrategy::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for ResolverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn remote_wins(ctx: &ConflictContext) -> bool {
    (ctx.remote_op.hlc, ctx.remote_op.device_id.as_bytes())
        > (ctx.local_op.hlc, ctx.local_op.device_id.as_bytes())
}

fn lww(ctx: &ConflictContext) -> Resolution {
    if remote_wins(ctx) {
        Resolution::TakeRemote
    } else {
        Resolution::KeepLocal
    }
}

fn field_merge(ctx: &ConflictContext, prefer_local: bool) -> Resolution {
    // A tombstone has no fields to merge against.
    if ctx.local_op.new_values.is_none() || ctx.remote_op.new_values.is_none() {
        return lww(ctx);
    }

    let mut merged = RowValues::new();
    let columns: std::collections::BTreeSet<&String> = ctx
        .local_values
        .keys()
        .chain(ctx.remote_values.keys())
        .collect();

    for column in columns {
        let merged_value = match (ctx.local_values.get(column), ctx.remote_values.get(column)) {
            (Some(local), None) => local.clone(),
            (None, Some(remote)) => remote.clone(),
            (Some(local), Some(remote)) if local == remote => local.clone(),
            (Some(local), Some(remote)) => {
                match ctx.local_op.hlc.cmp(&ctx.remote_op.hlc) {
                    std::cmp::Ordering::Greater => local.clone(),
                    std::cmp::Ordering::Less => remote.clone(),
                    std::cmp::Ordering::Equal => {
                        if prefer_local {
                            local.clone()
                        } else {
                            remote.clone()
                        }
                    }
                }
            }
            (None, None) => unreachable!("column came from one of the maps"),
        };
        merged.insert(column.clone(), merged_value);
    }
    Resolution::Merge(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_codec::{encode_row, Value};
    use meshsync_protocol::{DeviceId, Hlc, OpId, OpType, VectorClock};

    fn op(device: u8, hlc: Hlc, values: Option<RowValues>) -> Operation {
        let device = DeviceId::from_bytes([device; 16]);
        let mut clock = VectorClock::new();
        clock.increment(device);
        Operation {
            op_id: OpId::generate_at(hlc.wall_ms),
            device_id: device,
            parent_op_id: None,
            vector_clock: clock,
            hlc,
            table_name: "todos".into(),
            op_type: if values.is_some() {
                OpType::Update
            } else {
                OpType::Delete
            },
            row_pk: vec![1],
            old_values: None,
            new_values: values.map(|v| encode_row(&v).unwrap()),
            schema_version: 1,
            created_at: hlc.wall_ms as i64,
            is_local: false,
            applied_at: None,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> RowValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn ctx(local: Operation, remote: Operation) -> ConflictContext {
        ConflictContext::build(local, remote, None).unwrap()
    }

    #[test]
    fn lww_picks_greater_hlc() {
        let local = op(1, Hlc::new(100, 0), Some(row(&[("t", Value::text("a"))])));
        let remote = op(2, Hlc::new(200, 0), Some(row(&[("t", Value::text("b"))])));
        assert_eq!(
            ResolverStrategy::LastWriteWins.resolve(&ctx(local.clone(), remote.clone())),
            Resolution::TakeRemote
        );
        // Swap sides: the same op still wins.
        assert_eq!(
            ResolverStrategy::LastWriteWins.resolve(&ctx(remote, local)),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn lww_ties_break_on_device_id() {
        let local = op(2, Hlc::new(100, 0), Some(row(&[])));
        let remote = op(1, Hlc::new(100, 0), Some(row(&[])));
        // Device 2 > device 1, so local wins.
        assert_eq!(
            ResolverStrategy::LastWriteWins.resolve(&ctx(local, remote)),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn field_merge_takes_newer_column() {
        let local = op(
            1,
            Hlc::new(200, 0),
            Some(row(&[("title", Value::text("local")), ("done", Value::Integer(1))])),
        );
        let remote = op(
            2,
            Hlc::new(100, 0),
            Some(row(&[
                ("title", Value::text("remote")),
                ("priority", Value::Integer(5)),
            ])),
        );

        let Resolution::Merge(merged) =
            ResolverStrategy::FieldMerge { prefer_local: true }.resolve(&ctx(local, remote))
        else {
            panic!("expected merge");
        };
        assert_eq!(merged["title"], Value::text("local")); // newer hlc
        assert_eq!(merged["done"], Value::Integer(1)); // local-only
        assert_eq!(merged["priority"], Value::Integer(5)); // remote-only
    }

    #[test]
    fn field_merge_tie_uses_prefer_local() {
        let local = op(1, Hlc::new(100, 0), Some(row(&[("t", Value::text("l"))])));
        let remote = op(2, Hlc::new(100, 0), Some(row(&[("t", Value::text("r"))])));

        let Resolution::Merge(merged) = ResolverStrategy::FieldMerge { prefer_local: false }
            .resolve(&ctx(local.clone(), remote.clone()))
        else {
            panic!("expected merge");
        };
        assert_eq!(merged["t"], Value::text("r"));

        let Resolution::Merge(merged) =
            ResolverStrategy::FieldMerge { prefer_local: true }.resolve(&ctx(local, remote))
        else {
            panic!("expected merge");
        };
        assert_eq!(merged["t"], Value::text("l"));
    }

    #[test]
    fn field_merge_with_tombstone_falls_back_to_lww() {
        let local = op(1, Hlc::new(100, 0), Some(row(&[("t", Value::text("l"))])));
        let remote = op(2, Hlc::new(200, 0), None); // delete, newer
        assert_eq!(
            ResolverStrategy::FieldMerge { prefer_local: true }.resolve(&ctx(local, remote)),
            Resolution::TakeRemote
        );
    }

    #[test]
    fn manual_always_defers() {
        let local = op(1, Hlc::new(100, 0), Some(row(&[])));
        let remote = op(2, Hlc::new(200, 0), Some(row(&[])));
        assert_eq!(
            ResolverStrategy::Manual.resolve(&ctx(local, remote)),
            Resolution::Defer
        );
    }

    #[test]
    fn custom_delegates() {
        let strategy = ResolverStrategy::Custom(Arc::new(|ctx: &ConflictContext| {
            if ctx.table_name == "todos" {
                Resolution::KeepLocal
            } else {
                Resolution::Defer
            }
        }));
        let local = op(1, Hlc::new(100, 0), Some(row(&[])));
        let remote = op(2, Hlc::new(200, 0), Some(row(&[])));
        assert_eq!(strategy.resolve(&ctx(local, remote)), Resolution::KeepLocal);
        assert_eq!(strategy.name(), "custom");
    }
}
