//! The import pipeline: dedup, conflict detection, replay.
//!
//! [`apply_batch`] runs inside one transaction opened by the caller, with
//! capture suspended so replaying remote rows does not spawn new local
//! operations. Every incoming op is persisted to the log whatever happens
//! to the user row; conflict records capture the cases where the row did
//! not follow the op.

use meshsync_codec::{decode_pk, decode_row, RowValues};
use meshsync_protocol::{
    is_dominated_by_clock, sort_deterministic, CausalOrder, ConflictRecord, HlcClock, Operation,
    OpType,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::functions::{now_micros, value_from_sql, value_to_sql};
use crate::resolve::{ConflictContext, Resolution, ResolverStrategy};
use crate::{capture, conflicts, log, migrate};

/// Counters describing what a batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Operations handed to the batch.
    pub total: usize,
    /// Replayed into user tables (including stale no-ops and migrations).
    pub applied: usize,
    /// Fresh conflict records written.
    pub conflicts: usize,
    /// Conflicts a resolver declined to decide.
    pub deferred: usize,
    /// Already present (op id or clock position) and discarded.
    pub duplicates: usize,
    /// Logged but not replayed (table not opted in locally).
    pub skipped: usize,
}

impl BatchOutcome {
    /// Folds another outcome into this one.
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.total += other.total;
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.deferred += other.deferred;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
    }
}

/// Applies a batch of remote operations.
///
/// Caller contract: a transaction is open on `conn`, capture is suspended,
/// and the ops come from a peer (not local re-imports — those fall out as
/// duplicates anyway).
pub(crate) fn apply_batch(
    conn: &Connection,
    resolver: &ResolverStrategy,
    hlc: &Mutex<HlcClock>,
    mut ops: Vec<Operation>,
) -> EngineResult<BatchOutcome> {
    sort_deterministic(&mut ops);

    let mut outcome = BatchOutcome {
        total: ops.len(),
        ..BatchOutcome::default()
    };

    for op in ops {
        if log::operation_exists(conn, &op.op_id)? {
            outcome.duplicates += 1;
            continue;
        }
        let local_clock = log::load_clock(conn)?;
        if is_dominated_by_clock(&op, &local_clock) {
            outcome.duplicates += 1;
            continue;
        }

        apply_one(conn, resolver, &op, &mut outcome)?;

        // Fold the op into our causal state whether it mutated or not; the
        // log now holds it either way.
        log::merge_clock(conn, &op.vector_clock)?;
        hlc.lock().observe(op.hlc);
    }

    Ok(outcome)
}

fn apply_one(
    conn: &Connection,
    resolver: &ResolverStrategy,
    op: &Operation,
    outcome: &mut BatchOutcome,
) -> EngineResult<()> {
    let now = now_micros();

    if op.op_type == OpType::SchemaMigration {
        migrate::apply_migration_op(conn, op)?;
        let mut logged = op.clone();
        logged.is_local = false;
        logged.applied_at = Some(now);
        log::insert_operation(conn, &logged)?;
        outcome.applied += 1;
        return Ok(());
    }

    let Some((pk_columns, local_version)) = capture::enabled_table(conn, &op.table_name)? else {
        warn!(table = %op.table_name, op = %op.op_id, "op targets a table not opted in; logged unapplied");
        let mut logged = op.clone();
        logged.is_local = false;
        logged.applied_at = None;
        log::insert_operation(conn, &logged)?;
        outcome.skipped += 1;
        return Ok(());
    };

    if op.schema_version > local_version {
        return Err(EngineError::schema(format!(
            "op {} requires {} at schema version {}, local is {}",
            op.op_id, op.table_name, op.schema_version, local_version
        )));
    }

    let prev = log::last_writer_for_row(conn, &op.table_name, &op.row_pk)?;
    match prev {
        None => {
            replay(conn, op, &pk_columns)?;
            let mut logged = op.clone();
            logged.is_local = false;
            logged.applied_at = Some(now);
            log::insert_operation(conn, &logged)?;
            outcome.applied += 1;
        }
        Some(prev) => match op.vector_clock.compare(&prev.vector_clock) {
            CausalOrder::After => {
                replay(conn, op, &pk_columns)?;
                let mut logged = op.clone();
                logged.is_local = false;
                logged.applied_at = Some(now);
                log::insert_operation(conn, &logged)?;
                // A superseding write settles any open conflicts on the row;
                // the records are retained with this op as winner.
                conflicts::resolve_superseded(conn, op, &|id| log::get_operation(conn, id))?;
                outcome.applied += 1;
            }
            CausalOrder::Before => {
                // Stale: the row has already moved past this op. Keep it in
                // the log for history, never touch the row.
                debug!(op = %op.op_id, "stale op, row unchanged");
                let mut logged = op.clone();
                logged.is_local = false;
                logged.applied_at = Some(now);
                log::insert_operation(conn, &logged)?;
                outcome.applied += 1;
            }
            CausalOrder::Equal | CausalOrder::Concurrent => {
                handle_conflict(conn, resolver, op, prev, &pk_columns, now, outcome)?;
            }
        },
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_conflict(
    conn: &Connection,
    resolver: &ResolverStrategy,
    op: &Operation,
    prev: Operation,
    pk_columns: &[String],
    now: i64,
    outcome: &mut BatchOutcome,
) -> EngineResult<()> {
    // Persist the remote op unapplied; the log must hold both sides.
    let mut logged = op.clone();
    logged.is_local = false;
    logged.applied_at = None;
    log::insert_operation(conn, &logged)?;

    if conflicts::pair_exists(conn, &prev.op_id, &op.op_id)? {
        outcome.duplicates += 1;
        return Ok(());
    }

    let record = ConflictRecord::detected(
        op.table_name.clone(),
        op.row_pk.clone(),
        prev.op_id,
        op.op_id,
        now,
    );
    conflicts::insert(conn, &record)?;
    outcome.conflicts += 1;
    debug!(
        conflict = %record.conflict_id,
        table = %op.table_name,
        local = %prev.op_id,
        remote = %op.op_id,
        "concurrent writes on one row"
    );

    let current = current_row(conn, &op.table_name, pk_columns, &op.row_pk)?;
    let ctx = ConflictContext::build(prev.clone(), op.clone(), current)?;

    match resolver.resolve(&ctx) {
        Resolution::KeepLocal => {
            conflicts::mark_resolved(conn, &record.conflict_id, resolver.name(), Some(&prev.op_id))?;
        }
        Resolution::TakeRemote => {
            replay(conn, op, pk_columns)?;
            log::mark_applied(conn, &op.op_id, now)?;
            conflicts::mark_resolved(conn, &record.conflict_id, resolver.name(), Some(&op.op_id))?;
        }
        Resolution::Merge(values) => {
            write_row(conn, &op.table_name, pk_columns, &op.row_pk, &values)?;
            conflicts::mark_resolved(conn, &record.conflict_id, resolver.name(), None)?;
        }
        Resolution::Defer => {
            conflicts::mark_deferred(conn, &record.conflict_id)?;
            outcome.deferred += 1;
        }
    }
    Ok(())
}

/// Replays one operation against its user table.
fn replay(conn: &Connection, op: &Operation, pk_columns: &[String]) -> EngineResult<()> {
    match op.op_type {
        OpType::Insert => {
            let values = required_values(op)?;
            write_row(conn, &op.table_name, pk_columns, &op.row_pk, &values)
        }
        OpType::Update => {
            let values = required_values(op)?;
            let changed = update_row(conn, &op.table_name, pk_columns, &op.row_pk, &values)?;
            if changed == 0 {
                // Row absent (created before opt-in elsewhere, or resurrect
                // after delete); materialise it so peers converge.
                write_row(conn, &op.table_name, pk_columns, &op.row_pk, &values)?;
            }
            Ok(())
        }
        OpType::Delete => delete_row(conn, &op.table_name, pk_columns, &op.row_pk),
        OpType::SchemaMigration => Err(EngineError::InvalidState(
            "migration ops are replayed by the migration module".into(),
        )),
    }
}

fn required_values(op: &Operation) -> EngineResult<RowValues> {
    let blob = op.new_values.as_ref().ok_or_else(|| {
        EngineError::validation(format!(
            "{} op {} carries no new_values",
            op.op_type.as_str(),
            op.op_id
        ))
    })?;
    let values = decode_row(blob)?;
    if values.is_empty() {
        return Err(EngineError::validation(format!(
            "{} op {} carries an empty row image",
            op.op_type.as_str(),
            op.op_id
        )));
    }
    Ok(values)
}

fn where_clause(pk_columns: &[String], first_param: usize) -> String {
    pk_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("\"{col}\" = ?{}", first_param + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_params(pk_columns: &[String], row_pk: &[u8]) -> EngineResult<Vec<rusqlite::types::Value>> {
    let parts = decode_pk(row_pk)?;
    if parts.len() != pk_columns.len() {
        return Err(EngineError::validation(format!(
            "primary key arity mismatch: {} columns, {} values",
            pk_columns.len(),
            parts.len()
        )));
    }
    Ok(parts.iter().map(value_to_sql).collect())
}

/// Upserts a full row image.
pub(crate) fn write_row(
    conn: &Connection,
    table: &str,
    _pk_columns: &[String],
    _row_pk: &[u8],
    values: &RowValues,
) -> EngineResult<()> {
    capture::validate_table_name(table)?;
    let mut columns = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len());
    for (column, value) in values {
        capture::validate_column_name(column)?;
        columns.push(format!("\"{column}\""));
        params.push(value_to_sql(value));
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO \"{table}\" ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(())
}

/// Applies a row image via UPDATE; returns the number of rows changed.
pub(crate) fn update_row(
    conn: &Connection,
    table: &str,
    pk_columns: &[String],
    row_pk: &[u8],
    values: &RowValues,
) -> EngineResult<usize> {
    capture::validate_table_name(table)?;
    let mut sets = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len() + pk_columns.len());
    for (i, (column, value)) in values.iter().enumerate() {
        capture::validate_column_name(column)?;
        sets.push(format!("\"{column}\" = ?{}", i + 1));
        params.push(value_to_sql(value));
    }
    params.extend(pk_params(pk_columns, row_pk)?);

    let sql = format!(
        "UPDATE \"{table}\" SET {} WHERE {}",
        sets.join(", "),
        where_clause(pk_columns, values.len() + 1)
    );
    Ok(conn.execute(&sql, rusqlite::params_from_iter(params))?)
}

pub(crate) fn delete_row(
    conn: &Connection,
    table: &str,
    pk_columns: &[String],
    row_pk: &[u8],
) -> EngineResult<()> {
    capture::validate_table_name(table)?;
    let sql = format!(
        "DELETE FROM \"{table}\" WHERE {}",
        where_clause(pk_columns, 1)
    );
    conn.execute(&sql, rusqlite::params_from_iter(pk_params(pk_columns, row_pk)?))?;
    Ok(())
}

/// Reads the current image of a row, if present.
pub(crate) fn current_row(
    conn: &Connection,
    table: &str,
    pk_columns: &[String],
    row_pk: &[u8],
) -> EngineResult<Option<RowValues>> {
    capture::validate_table_name(table)?;
    let sql = format!(
        "SELECT * FROM \"{table}\" WHERE {}",
        where_clause(pk_columns, 1)
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(pk_params(pk_columns, row_pk)?))?;

    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let mut image = RowValues::new();
    for (i, name) in names.iter().enumerate() {
        image.insert(name.clone(), value_from_sql(row.get_ref(i)?)?);
    }
    Ok(Some(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device, functions, schema};
    use meshsync_codec::{encode_pk, encode_row, Value};
    use meshsync_protocol::{DeviceId, Hlc, OpId, VectorClock};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        functions::register_for_tests(&conn);
        schema::initialize(&conn).unwrap();
        let dev = device::load_or_create(&conn, None).unwrap();
        log::ensure_clock_row(&conn, &dev.device_id).unwrap();
        conn.execute_batch(
            "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER)",
        )
        .unwrap();
        let info = capture::table_info(&conn, "todos").unwrap();
        capture::record_enabled(&conn, "todos", &info).unwrap();
        conn
    }

    fn hlc() -> Mutex<HlcClock> {
        Mutex::new(HlcClock::new())
    }

    fn remote_op(
        device: u8,
        counter: u64,
        base: VectorClock,
        op_type: OpType,
        id: i64,
        title: &str,
        wall: u64,
    ) -> Operation {
        let device = DeviceId::from_bytes([device; 16]);
        let mut clock = base;
        for _ in clock.counter_for(&device)..counter {
            clock.increment(device);
        }
        let mut row = RowValues::new();
        row.insert("id".into(), Value::Integer(id));
        row.insert("title".into(), Value::text(title));
        row.insert("done".into(), Value::Integer(0));
        Operation {
            op_id: OpId::generate_at(wall),
            device_id: device,
            parent_op_id: None,
            vector_clock: clock,
            hlc: Hlc::new(wall, 0),
            table_name: "todos".into(),
            op_type,
            row_pk: encode_pk(&[Value::Integer(id)]).unwrap(),
            old_values: None,
            new_values: match op_type {
                OpType::Delete => None,
                _ => Some(encode_row(&row).unwrap()),
            },
            schema_version: 1,
            created_at: wall as i64,
            is_local: false,
            applied_at: None,
        }
    }

    fn title_of(conn: &Connection, id: i64) -> Option<String> {
        conn.query_row("SELECT title FROM todos WHERE id = ?1", [id], |r| r.get(0))
            .ok()
    }

    #[test]
    fn fresh_insert_applies() {
        let conn = setup();
        let op = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "hello", 100);
        let outcome = apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![op]).unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(title_of(&conn, 1).as_deref(), Some("hello"));

        // Clock folded in.
        let clock = log::load_clock(&conn).unwrap();
        assert_eq!(clock.counter_for(&DeviceId::from_bytes([9; 16])), 1);
    }

    #[test]
    fn duplicate_op_is_discarded() {
        let conn = setup();
        let op = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "hello", 100);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![op.clone()]).unwrap();
        let outcome = apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![op]).unwrap();

        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.applied, 0);
        assert_eq!(log::count_operations(&conn).unwrap(), 1);
    }

    #[test]
    fn causal_update_supersedes() {
        let conn = setup();
        let insert = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "v1", 100);
        let update = remote_op(
            9,
            2,
            insert.vector_clock.clone(),
            OpType::Update,
            1,
            "v2",
            200,
        );
        let outcome = apply_batch(
            &conn,
            &ResolverStrategy::Manual,
            &hlc(),
            vec![update, insert], // delivered out of order on purpose
        )
        .unwrap();

        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(title_of(&conn, 1).as_deref(), Some("v2"));
    }

    #[test]
    fn concurrent_updates_conflict_and_defer_under_manual() {
        let conn = setup();
        let base = remote_op(8, 1, VectorClock::new(), OpType::Insert, 1, "base", 100);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![base.clone()]).unwrap();

        // Two devices update concurrently on top of the same base.
        let from_a = remote_op(8, 2, base.vector_clock.clone(), OpType::Update, 1, "A", 200);
        let from_b = remote_op(7, 1, base.vector_clock.clone(), OpType::Update, 1, "B", 300);

        let first = apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![from_a.clone()])
            .unwrap();
        assert_eq!(first.conflicts, 0); // supersedes base cleanly

        let second =
            apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![from_b]).unwrap();
        assert_eq!(second.conflicts, 1);
        assert_eq!(second.deferred, 1);

        // Manual strategy leaves the row untouched.
        assert_eq!(title_of(&conn, 1).as_deref(), Some("A"));
        assert_eq!(conflicts::unresolved(&conn).unwrap().len(), 1);
    }

    #[test]
    fn lww_resolves_concurrent_update() {
        let conn = setup();
        let base = remote_op(8, 1, VectorClock::new(), OpType::Insert, 1, "base", 100);
        apply_batch(&conn, &ResolverStrategy::LastWriteWins, &hlc(), vec![base.clone()]).unwrap();

        let newer = remote_op(8, 2, base.vector_clock.clone(), OpType::Update, 1, "old", 200);
        apply_batch(&conn, &ResolverStrategy::LastWriteWins, &hlc(), vec![newer]).unwrap();

        // Concurrent update with a later wall clock wins under LWW.
        let winner = remote_op(7, 1, base.vector_clock.clone(), OpType::Update, 1, "new", 900);
        let outcome =
            apply_batch(&conn, &ResolverStrategy::LastWriteWins, &hlc(), vec![winner]).unwrap();

        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.deferred, 0);
        assert_eq!(title_of(&conn, 1).as_deref(), Some("new"));
        assert!(conflicts::unresolved(&conn).unwrap().is_empty());
    }

    #[test]
    fn stale_update_mutates_nothing() {
        let conn = setup();
        let insert = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "v1", 100);
        let update = remote_op(9, 2, insert.vector_clock.clone(), OpType::Update, 1, "v2", 200);

        apply_batch(
            &conn,
            &ResolverStrategy::Manual,
            &hlc(),
            vec![insert.clone(), update],
        )
        .unwrap();
        assert_eq!(title_of(&conn, 1).as_deref(), Some("v2"));

        // Re-delivering the superseded insert is discarded by dedup.
        let outcome =
            apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![insert]).unwrap();
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(title_of(&conn, 1).as_deref(), Some("v2"));
    }

    #[test]
    fn concurrent_delete_vs_update_conflicts() {
        let conn = setup();
        let base = remote_op(8, 1, VectorClock::new(), OpType::Insert, 1, "base", 100);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![base.clone()]).unwrap();

        let update = remote_op(8, 2, base.vector_clock.clone(), OpType::Update, 1, "upd", 200);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![update]).unwrap();

        let delete = remote_op(7, 1, base.vector_clock.clone(), OpType::Delete, 1, "", 300);
        let outcome =
            apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![delete]).unwrap();

        assert_eq!(outcome.conflicts, 1);
        // Manual strategy: the surviving row is preserved.
        assert_eq!(title_of(&conn, 1).as_deref(), Some("upd"));
    }

    #[test]
    fn unknown_table_is_logged_but_skipped() {
        let conn = setup();
        let mut op = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "x", 100);
        op.table_name = "not_enabled".into();
        let outcome = apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![op.clone()])
            .unwrap();

        assert_eq!(outcome.skipped, 1);
        assert!(log::operation_exists(&conn, &op.op_id).unwrap());
    }

    #[test]
    fn newer_schema_version_aborts_with_schema_error() {
        let conn = setup();
        let mut op = remote_op(9, 1, VectorClock::new(), OpType::Insert, 1, "x", 100);
        op.schema_version = 2;
        let err = apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![op]).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
        assert_eq!(title_of(&conn, 1), None);
    }

    #[test]
    fn superseding_op_closes_open_conflicts() {
        let conn = setup();
        let base = remote_op(8, 1, VectorClock::new(), OpType::Insert, 1, "base", 100);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![base.clone()]).unwrap();

        let from_a = remote_op(8, 2, base.vector_clock.clone(), OpType::Update, 1, "A", 200);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![from_a.clone()]).unwrap();
        let from_b = remote_op(7, 1, base.vector_clock.clone(), OpType::Update, 1, "B", 300);
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![from_b.clone()]).unwrap();
        assert_eq!(conflicts::unresolved(&conn).unwrap().len(), 1);

        // An op dominating both sides settles the row and the record.
        let mut settled_clock = from_a.vector_clock.clone();
        settled_clock.merge(&from_b.vector_clock);
        settled_clock.increment(DeviceId::from_bytes([7; 16]));
        let mut row = RowValues::new();
        row.insert("id".into(), Value::Integer(1));
        row.insert("title".into(), Value::text("settled"));
        row.insert("done".into(), Value::Integer(1));
        let settle = Operation {
            op_id: OpId::generate_at(900),
            device_id: DeviceId::from_bytes([7; 16]),
            parent_op_id: Some(from_b.op_id),
            vector_clock: settled_clock,
            hlc: Hlc::new(900, 0),
            table_name: "todos".into(),
            op_type: OpType::Update,
            row_pk: base.row_pk.clone(),
            old_values: None,
            new_values: Some(encode_row(&row).unwrap()),
            schema_version: 1,
            created_at: 900,
            is_local: false,
            applied_at: None,
        };
        apply_batch(&conn, &ResolverStrategy::Manual, &hlc(), vec![settle]).unwrap();

        assert!(conflicts::unresolved(&conn).unwrap().is_empty());
        assert_eq!(title_of(&conn, 1).as_deref(), Some("settled"));
    }
}
