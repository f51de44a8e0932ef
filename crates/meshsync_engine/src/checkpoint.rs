//! Crash-safe apply checkpoints.
//!
//! Every import batch is bracketed by a checkpoint row. The `in_progress`
//! row is committed before the batch transaction opens; the batch's own
//! commit flips it to `committed` in the same transaction as the data, so a
//! crash anywhere leaves either a committed checkpoint with all its data or
//! an `in_progress` marker with none. Recovery marks stragglers `aborted`
//! and the next import simply re-applies — dedup makes that idempotent.

use meshsync_protocol::{OpId, VectorClock};
use rusqlite::{Connection, OptionalExtension};

use crate::error::{EngineError, EngineResult};
use crate::functions::now_micros;

/// Lifecycle of a checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Batch is (or was, if we crashed) being applied.
    InProgress,
    /// Batch committed.
    Committed,
    /// Batch rolled back; the data never landed.
    Aborted,
}

impl CheckpointStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Committed => "committed",
            CheckpointStatus::Aborted => "aborted",
        }
    }

    fn from_str(code: &str) -> Option<Self> {
        match code {
            "in_progress" => Some(CheckpointStatus::InProgress),
            "committed" => Some(CheckpointStatus::Committed),
            "aborted" => Some(CheckpointStatus::Aborted),
            _ => None,
        }
    }
}

/// A persisted apply bracket.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Unique id.
    pub checkpoint_id: [u8; 16],
    /// Creation wall time, Unix microseconds.
    pub started_at: i64,
    /// First op of the batch, when known.
    pub last_applied_op_id: Option<OpId>,
    /// The engine clock when the batch began.
    pub vector_clock_at_start: VectorClock,
    /// Current status.
    pub status: CheckpointStatus,
}

/// Writes a fresh `in_progress` checkpoint. The caller must commit it
/// before opening the batch transaction.
pub(crate) fn create(
    conn: &Connection,
    clock: &VectorClock,
    first_op: Option<&OpId>,
) -> EngineResult<Checkpoint> {
    let checkpoint = Checkpoint {
        checkpoint_id: OpId::generate().into(),
        started_at: now_micros(),
        last_applied_op_id: first_op.copied(),
        vector_clock_at_start: clock.clone(),
        status: CheckpointStatus::InProgress,
    };
    conn.execute(
        "INSERT INTO sync_checkpoints (
            checkpoint_id, started_at, last_applied_op_id,
            vector_clock_at_start, status
        ) VALUES (?1, ?2, ?3, ?4, 'in_progress')",
        rusqlite::params![
            checkpoint.checkpoint_id,
            checkpoint.started_at,
            checkpoint
                .last_applied_op_id
                .as_ref()
                .map(|id| id.as_bytes().to_vec()),
            checkpoint.vector_clock_at_start.encode()?,
        ],
    )?;
    Ok(checkpoint)
}

fn set_status(
    conn: &Connection,
    checkpoint_id: &[u8; 16],
    from: CheckpointStatus,
    to: CheckpointStatus,
) -> EngineResult<()> {
    let changed = conn.execute(
        "UPDATE sync_checkpoints SET status = ?1 WHERE checkpoint_id = ?2 AND status = ?3",
        rusqlite::params![to.as_str(), checkpoint_id, from.as_str()],
    )?;
    if changed == 0 {
        return Err(EngineError::InvalidState(format!(
            "checkpoint not in {} state",
            from.as_str()
        )));
    }
    Ok(())
}

/// Marks a checkpoint committed. Run as the final statement of the batch
/// transaction so the flip commits atomically with the data.
pub(crate) fn mark_committed(conn: &Connection, checkpoint_id: &[u8; 16]) -> EngineResult<()> {
    set_status(
        conn,
        checkpoint_id,
        CheckpointStatus::InProgress,
        CheckpointStatus::Committed,
    )
}

/// Marks a checkpoint aborted after its transaction rolled back.
pub(crate) fn mark_aborted(conn: &Connection, checkpoint_id: &[u8; 16]) -> EngineResult<()> {
    set_status(
        conn,
        checkpoint_id,
        CheckpointStatus::InProgress,
        CheckpointStatus::Aborted,
    )
}

/// Records how far the batch has progressed (inside the batch transaction).
pub(crate) fn record_progress(
    conn: &Connection,
    checkpoint_id: &[u8; 16],
    last_op: &OpId,
) -> EngineResult<()> {
    conn.execute(
        "UPDATE sync_checkpoints SET last_applied_op_id = ?1 WHERE checkpoint_id = ?2",
        rusqlite::params![last_op.as_bytes(), checkpoint_id],
    )?;
    Ok(())
}

/// Any checkpoint still `in_progress` (at most one exists per device under
/// normal operation, but recovery sweeps all of them).
pub(crate) fn incomplete(conn: &Connection) -> EngineResult<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(
        "SELECT checkpoint_id, started_at, last_applied_op_id, vector_clock_at_start, status
         FROM sync_checkpoints WHERE status = 'in_progress' ORDER BY started_at",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, [u8; 16]>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<[u8; 16]>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, started_at, last_op, clock_blob, status)| {
            Ok(Checkpoint {
                checkpoint_id: id,
                started_at,
                last_applied_op_id: last_op.map(OpId::from_bytes),
                vector_clock_at_start: VectorClock::decode(&clock_blob)?,
                status: CheckpointStatus::from_str(&status)
                    .ok_or_else(|| EngineError::InvalidState("bad checkpoint status".into()))?,
            })
        })
        .collect()
}

/// Recovery sweep: marks every `in_progress` checkpoint aborted.
///
/// Called on engine open. The store's own atomicity already rolled back any
/// user-visible half-applied state; this records the fact so the aborted
/// batch is visibly distinguishable from a committed one.
pub(crate) fn recover(conn: &Connection) -> EngineResult<usize> {
    let stale = incomplete(conn)?;
    for checkpoint in &stale {
        tracing::warn!(
            checkpoint = %uuid_text(&checkpoint.checkpoint_id),
            "found interrupted import, marking aborted"
        );
        mark_aborted(conn, &checkpoint.checkpoint_id)?;
    }
    Ok(stale.len())
}

fn uuid_text(bytes: &[u8; 16]) -> String {
    OpId::from_bytes(*bytes).to_string()
}

/// True if one in-flight checkpoint already exists.
pub(crate) fn has_in_progress(conn: &Connection) -> EngineResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_checkpoints WHERE status = 'in_progress' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
