//! Operation log persistence.
//!
//! The log is the source of truth: every operation is persisted whether or
//! not it mutated user state. Readers reconstruct [`Operation`] values from
//! rows; writers go through [`insert_operation`] so every column is bound
//! the same way everywhere.

use meshsync_protocol::{
    cmp_operations, sort_deterministic, DeviceId, Hlc, OpId, Operation, OpType, VectorClock,
};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{EngineError, EngineResult};

pub(crate) const OP_COLUMNS: &str = "op_id, device_id, parent_op_id, vector_clock, hlc, table_name, \
     op_type, row_pk, old_values, new_values, schema_version, device_counter, \
     created_at, is_local, applied_at";

fn decode_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(err))
}

/// Reconstructs an operation from a `SELECT <OP_COLUMNS>` row.
pub(crate) fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let op_id: [u8; 16] = row.get(0)?;
    let device_id: [u8; 16] = row.get(1)?;
    let parent: Option<[u8; 16]> = row.get(2)?;
    let clock_blob: Vec<u8> = row.get(3)?;
    let hlc_text: String = row.get(4)?;
    let op_type_text: String = row.get(6)?;

    Ok(Operation {
        op_id: OpId::from_bytes(op_id),
        device_id: DeviceId::from_bytes(device_id),
        parent_op_id: parent.map(OpId::from_bytes),
        vector_clock: VectorClock::decode(&clock_blob).map_err(|e| decode_err(3, e))?,
        hlc: Hlc::parse(&hlc_text).map_err(|e| decode_err(4, e))?,
        table_name: row.get(5)?,
        op_type: OpType::from_str(&op_type_text).ok_or_else(|| {
            decode_err(6, EngineError::validation(format!("bad op_type {op_type_text}")))
        })?,
        row_pk: row.get(7)?,
        old_values: row.get(8)?,
        new_values: row.get(9)?,
        schema_version: row.get(10)?,
        created_at: row.get(12)?,
        is_local: row.get::<_, i64>(13)? != 0,
        applied_at: row.get(14)?,
    })
}

/// Appends an operation to the log.
pub(crate) fn insert_operation(conn: &Connection, op: &Operation) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO sync_operations (
            op_id, device_id, parent_op_id, vector_clock, hlc, table_name,
            op_type, row_pk, old_values, new_values, schema_version,
            device_counter, created_at, is_local, applied_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            op.op_id.as_bytes(),
            op.device_id.as_bytes(),
            op.parent_op_id.as_ref().map(|p| p.as_bytes().to_vec()),
            op.vector_clock.encode()?,
            op.hlc.to_string(),
            op.table_name,
            op.op_type.as_str(),
            op.row_pk,
            op.old_values,
            op.new_values,
            op.schema_version,
            op.device_counter() as i64,
            op.created_at,
            i64::from(op.is_local),
            op.applied_at,
        ],
    )?;
    Ok(())
}

/// True if the op id is already in the log.
pub(crate) fn operation_exists(conn: &Connection, op_id: &OpId) -> EngineResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_operations WHERE op_id = ?1",
            [op_id.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Fetches one operation by id.
pub(crate) fn get_operation(conn: &Connection, op_id: &OpId) -> EngineResult<Option<Operation>> {
    let op = conn
        .query_row(
            &format!("SELECT {OP_COLUMNS} FROM sync_operations WHERE op_id = ?1"),
            [op_id.as_bytes()],
            operation_from_row,
        )
        .optional()?;
    Ok(op)
}

/// Marks an operation as replayed into the user table.
pub(crate) fn mark_applied(conn: &Connection, op_id: &OpId, at: i64) -> EngineResult<()> {
    conn.execute(
        "UPDATE sync_operations SET applied_at = ?1 WHERE op_id = ?2 AND applied_at IS NULL",
        rusqlite::params![at, op_id.as_bytes()],
    )?;
    Ok(())
}

/// Operations whose per-device counter exceeds the given clock's entry for
/// their originator, in deterministic order. This is the delta a peer with
/// clock `since` still lacks.
pub(crate) fn get_new_operations(
    conn: &Connection,
    since: &VectorClock,
) -> EngineResult<Vec<Operation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OP_COLUMNS} FROM sync_operations"
    ))?;
    let mut ops: Vec<Operation> = stmt
        .query_map([], operation_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    ops.retain(|op| op.device_counter() > since.counter_for(&op.device_id));
    sort_deterministic(&mut ops);
    Ok(ops)
}

/// All operations ever logged against one row.
pub(crate) fn get_operations_for_row(
    conn: &Connection,
    table: &str,
    row_pk: &[u8],
) -> EngineResult<Vec<Operation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OP_COLUMNS} FROM sync_operations
         WHERE table_name = ?1 AND row_pk = ?2"
    ))?;
    let ops = stmt
        .query_map(rusqlite::params![table, row_pk], operation_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ops)
}

/// The operation whose values the row currently reflects: the greatest
/// applied op on the row under the global deterministic order. Both peers
/// compute the same answer from the same log, which keeps conflict
/// detection convergent.
pub(crate) fn last_writer_for_row(
    conn: &Connection,
    table: &str,
    row_pk: &[u8],
) -> EngineResult<Option<Operation>> {
    let ops = get_operations_for_row(conn, table, row_pk)?;
    Ok(ops
        .into_iter()
        .filter(|op| op.applied_at.is_some())
        .max_by(cmp_operations))
}

/// The most recent locally-captured op id (parent for the next capture).
pub(crate) fn local_head(conn: &Connection) -> EngineResult<Option<Operation>> {
    let op = conn
        .query_row(
            &format!(
                "SELECT {OP_COLUMNS} FROM sync_operations
                 WHERE is_local = 1 ORDER BY device_counter DESC LIMIT 1"
            ),
            [],
            operation_from_row,
        )
        .optional()?;
    Ok(op)
}

/// Loads the persisted vector clock.
pub(crate) fn load_clock(conn: &Connection) -> EngineResult<VectorClock> {
    let mut stmt = conn.prepare("SELECT device_id, counter FROM sync_vector_clock")?;
    let entries = stmt
        .query_map([], |row| {
            Ok((row.get::<_, [u8; 16]>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries
        .into_iter()
        .map(|(id, counter)| (DeviceId::from_bytes(id), counter.max(0) as u64))
        .collect())
}

/// Folds a clock into the persisted one (element-wise max).
pub(crate) fn merge_clock(conn: &Connection, clock: &VectorClock) -> EngineResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO sync_vector_clock (device_id, counter) VALUES (?1, ?2)
         ON CONFLICT (device_id) DO UPDATE SET counter = max(counter, excluded.counter)",
    )?;
    for (device, counter) in clock.iter() {
        stmt.execute(rusqlite::params![device.as_bytes(), *counter as i64])?;
    }
    Ok(())
}

/// Ensures the local device has a clock row so triggers can bump it.
pub(crate) fn ensure_clock_row(conn: &Connection, device: &DeviceId) -> EngineResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_vector_clock (device_id, counter) VALUES (?1, 0)",
        [device.as_bytes()],
    )?;
    Ok(())
}

/// Bumps the local device's counter and returns the updated clock.
/// Used by engine-originated operations (migrations, resolutions) that do
/// not pass through a capture trigger.
pub(crate) fn increment_clock(conn: &Connection, device: &DeviceId) -> EngineResult<VectorClock> {
    conn.execute(
        "UPDATE sync_vector_clock SET counter = counter + 1 WHERE device_id = ?1",
        [device.as_bytes()],
    )?;
    load_clock(conn)
}

/// Total number of logged operations.
pub(crate) fn count_operations(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row("SELECT count(*) FROM sync_operations", [], |r| r.get(0))?)
}
