//! Conflict record persistence.

use meshsync_protocol::{ConflictId, ConflictRecord, OpId, Operation, ResolutionState};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{EngineError, EngineResult};

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let conflict_id: [u8; 16] = row.get(0)?;
    let local: [u8; 16] = row.get(3)?;
    let remote: [u8; 16] = row.get(4)?;
    let state: String = row.get(6)?;
    let winning: Option<[u8; 16]> = row.get(8)?;

    Ok(ConflictRecord {
        conflict_id: ConflictId::from_bytes(conflict_id),
        table_name: row.get(1)?,
        row_pk: row.get(2)?,
        local_op_id: OpId::from_bytes(local),
        remote_op_id: OpId::from_bytes(remote),
        detected_at: row.get(5)?,
        resolution_state: ResolutionState::from_str(&state).unwrap_or(ResolutionState::Unresolved),
        resolved_by: row.get(7)?,
        winning_op_id: winning.map(OpId::from_bytes),
    })
}

const COLUMNS: &str = "conflict_id, table_name, row_pk, local_op_id, remote_op_id, \
     detected_at, resolution_state, resolved_by, winning_op_id";

/// Persists a freshly detected conflict.
pub(crate) fn insert(conn: &Connection, record: &ConflictRecord) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO sync_conflicts (
            conflict_id, table_name, row_pk, local_op_id, remote_op_id,
            detected_at, resolution_state, resolved_by, winning_op_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            record.conflict_id.as_bytes(),
            record.table_name,
            record.row_pk,
            record.local_op_id.as_bytes(),
            record.remote_op_id.as_bytes(),
            record.detected_at,
            record.resolution_state.as_str(),
            record.resolved_by,
            record.winning_op_id.as_ref().map(|id| id.as_bytes().to_vec()),
        ],
    )?;
    Ok(())
}

/// True if this exact op pair is already recorded for the row, in either
/// orientation. Keeps re-delivery from duplicating conflicts.
pub(crate) fn pair_exists(
    conn: &Connection,
    local: &OpId,
    remote: &OpId,
) -> EngineResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_conflicts
             WHERE (local_op_id = ?1 AND remote_op_id = ?2)
                OR (local_op_id = ?2 AND remote_op_id = ?1)",
            rusqlite::params![local.as_bytes(), remote.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Fetches a conflict by id.
pub(crate) fn get(
    conn: &Connection,
    conflict_id: &ConflictId,
) -> EngineResult<Option<ConflictRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM sync_conflicts WHERE conflict_id = ?1"),
            [conflict_id.as_bytes()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// All conflicts not yet resolved, oldest first.
pub(crate) fn unresolved(conn: &Connection) -> EngineResult<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sync_conflicts
         WHERE resolution_state != 'resolved'
         ORDER BY detected_at"
    ))?;
    let records = stmt
        .query_map([], record_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(records)
}

/// Open conflicts on one row.
pub(crate) fn open_for_row(
    conn: &Connection,
    table: &str,
    row_pk: &[u8],
) -> EngineResult<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sync_conflicts
         WHERE table_name = ?1 AND row_pk = ?2 AND resolution_state != 'resolved'"
    ))?;
    let records = stmt
        .query_map(rusqlite::params![table, row_pk], record_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(records)
}

/// Marks a conflict resolved. Fails if it was already resolved.
pub(crate) fn mark_resolved(
    conn: &Connection,
    conflict_id: &ConflictId,
    resolved_by: &str,
    winning_op_id: Option<&OpId>,
) -> EngineResult<()> {
    let changed = conn.execute(
        "UPDATE sync_conflicts
         SET resolution_state = 'resolved', resolved_by = ?1, winning_op_id = ?2
         WHERE conflict_id = ?3 AND resolution_state != 'resolved'",
        rusqlite::params![
            resolved_by,
            winning_op_id.map(|id| id.as_bytes().to_vec()),
            conflict_id.as_bytes(),
        ],
    )?;
    if changed == 0 {
        return Err(EngineError::InvalidState(format!(
            "conflict {conflict_id} not found or already resolved"
        )));
    }
    Ok(())
}

/// Marks a conflict deferred (a resolver declined to decide).
pub(crate) fn mark_deferred(conn: &Connection, conflict_id: &ConflictId) -> EngineResult<()> {
    conn.execute(
        "UPDATE sync_conflicts SET resolution_state = 'deferred'
         WHERE conflict_id = ?1 AND resolution_state = 'unresolved'",
        [conflict_id.as_bytes()],
    )?;
    Ok(())
}

/// Closes any open conflicts on a row that an incoming operation causally
/// supersedes: the new values settle the row, the record is retained with
/// the superseding op as winner.
pub(crate) fn resolve_superseded(
    conn: &Connection,
    op: &Operation,
    local_ops: &dyn Fn(&OpId) -> EngineResult<Option<Operation>>,
) -> EngineResult<usize> {
    let mut closed = 0;
    for record in open_for_row(conn, &op.table_name, &op.row_pk)? {
        let dominates_both = [&record.local_op_id, &record.remote_op_id]
            .into_iter()
            .all(|id| match local_ops(id) {
                Ok(Some(past)) => op.vector_clock.dominates(&past.vector_clock),
                _ => false,
            });
        if dominates_both {
            mark_resolved(conn, &record.conflict_id, "superseded", Some(&op.op_id))?;
            closed += 1;
        }
    }
    Ok(closed)
}
