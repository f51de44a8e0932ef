//! Log compaction.
//!
//! The operation log grows without bound until acknowledged ops are
//! pruned. An op is safe to prune only when every known peer's
//! `last_received_vector_clock` dominates its clock — every peer has folded
//! it in, so nobody can ever need it again. The local chain head and ops
//! referenced by open conflicts are always kept. With no recorded peers
//! nothing is ever pruned.

use meshsync_protocol::{OpId, VectorClock};
use rusqlite::Connection;
use tracing::info;

use crate::error::EngineResult;
use crate::{conflicts, log, peers};

/// Result of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Ops examined.
    pub scanned: usize,
    /// Ops deleted.
    pub pruned: usize,
}

/// Prunes fully-acknowledged ops, at most `max_ops` per pass.
///
/// Caller contract: runs inside a transaction with the log guard
/// disengaged.
pub(crate) fn compact_log(conn: &Connection, max_ops: usize) -> EngineResult<CompactionOutcome> {
    let peer_clocks: Vec<VectorClock> = peers::all(conn)?
        .into_iter()
        .map(|peer| peer.last_received_vector_clock)
        .collect();
    if peer_clocks.is_empty() {
        return Ok(CompactionOutcome::default());
    }

    let keep_head: Option<OpId> = log::local_head(conn)?.map(|op| op.op_id);
    let pinned: std::collections::HashSet<OpId> = conflicts::unresolved(conn)?
        .into_iter()
        .flat_map(|record| [record.local_op_id, record.remote_op_id])
        .chain(keep_head)
        .collect();

    let all = log::get_new_operations(conn, &VectorClock::new())?;
    let mut outcome = CompactionOutcome {
        scanned: all.len(),
        ..CompactionOutcome::default()
    };

    for op in all {
        if outcome.pruned >= max_ops {
            break;
        }
        if pinned.contains(&op.op_id) {
            continue;
        }
        let acknowledged_everywhere = peer_clocks
            .iter()
            .all(|peer_clock| peer_clock.dominates(&op.vector_clock));
        if !acknowledged_everywhere {
            continue;
        }
        conn.execute(
            "DELETE FROM sync_operations WHERE op_id = ?1",
            [op.op_id.as_bytes()],
        )?;
        outcome.pruned += 1;
    }

    if outcome.pruned > 0 {
        info!(pruned = outcome.pruned, "compacted operation log");
    }
    Ok(outcome)
}
