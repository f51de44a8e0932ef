//! SQL functions backing trigger capture.
//!
//! Capture triggers run inside the user's transaction, so everything they
//! need — fresh op ids, HLC stamps, canonical row/pk blobs, the encoded
//! vector clock — is exposed to SQL as connection-local functions. The two
//! gate functions let the engine suspend capture during replay and unlock
//! the append-only log for compaction without dropping any triggers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meshsync_codec::{encode_pk, encode_row, RowValues, Value};
use meshsync_protocol::{HlcClock, OpId};
use parking_lot::Mutex;
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::EngineResult;

/// Current wall time in Unix microseconds.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Converts a SQL value into its codec form.
pub(crate) fn value_from_sql(value: ValueRef<'_>) -> rusqlite::Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(
            std::str::from_utf8(t)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?
                .to_string(),
        ),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    })
}

/// Converts a codec value into a bindable SQL value.
pub(crate) fn value_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Integer(n) => Sql::Integer(*n),
        Value::Real(f) => Sql::Real(*f),
        Value::Text(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        // Nested values never come out of capture, but replicated rows may
        // carry them; they round-trip as canonical blobs.
        nested @ (Value::Array(_) | Value::Map(_)) => {
            Sql::Blob(meshsync_codec::encode_value(nested).unwrap_or_default())
        }
    }
}

fn user_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

/// Aggregate collecting `(device_id, counter)` rows into the canonical
/// vector-clock blob. Used by capture triggers as
/// `(SELECT meshsync_clock(device_id, counter) FROM sync_vector_clock)`.
struct ClockAggregate;

impl Aggregate<Vec<(Value, Value)>, Vec<u8>> for ClockAggregate {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Vec<(Value, Value)>> {
        Ok(Vec::new())
    }

    fn step(
        &self,
        ctx: &mut Context<'_>,
        pairs: &mut Vec<(Value, Value)>,
    ) -> rusqlite::Result<()> {
        let device = ctx.get_raw(0).as_blob()?.to_vec();
        let counter = ctx.get_raw(1).as_i64()?;
        if counter > 0 {
            pairs.push((Value::Bytes(device), Value::Integer(counter)));
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        pairs: Option<Vec<(Value, Value)>>,
    ) -> rusqlite::Result<Vec<u8>> {
        meshsync_codec::encode_value(&Value::map(pairs.unwrap_or_default()))
            .map_err(user_error)
    }
}

/// Registers every `meshsync_*` SQL function on the connection.
///
/// Must run before [`crate::schema::initialize`] and before any trigger can
/// fire; the objects in the persisted schema reference these names.
pub(crate) fn register(
    conn: &Connection,
    hlc: Arc<Mutex<HlcClock>>,
    capture_gate: Arc<AtomicBool>,
    log_guard: Arc<AtomicBool>,
) -> EngineResult<()> {
    let volatile = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS;
    let pure = volatile | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("meshsync_op_id", 0, volatile, |_ctx| {
        Ok(OpId::generate().as_bytes().to_vec())
    })?;

    conn.create_scalar_function("meshsync_now", 0, volatile, |_ctx| Ok(now_micros()))?;

    // rusqlite wraps user functions in catch_unwind; the mutex guard state
    // stays consistent because tick() cannot panic.
    let hlc = std::panic::AssertUnwindSafe(hlc);
    conn.create_scalar_function("meshsync_hlc", 0, volatile, move |_ctx| {
        let _ = &hlc; // force capture of the whole AssertUnwindSafe wrapper, not just field 0
        Ok(hlc.0.lock().tick().to_string())
    })?;

    conn.create_scalar_function("meshsync_capture_on", 0, volatile, move |_ctx| {
        Ok(i64::from(capture_gate.load(Ordering::SeqCst)))
    })?;

    conn.create_scalar_function("meshsync_log_guard", 0, volatile, move |_ctx| {
        Ok(i64::from(log_guard.load(Ordering::SeqCst)))
    })?;

    // meshsync_row('col', value, 'col2', value2, ...) -> canonical row blob
    conn.create_scalar_function("meshsync_row", -1, pure, |ctx| {
        if ctx.len() % 2 != 0 {
            return Err(rusqlite::Error::UserFunctionError(
                "meshsync_row takes name/value pairs".into(),
            ));
        }
        let mut row = RowValues::new();
        for i in (0..ctx.len()).step_by(2) {
            let name = ctx.get::<String>(i)?;
            row.insert(name, value_from_sql(ctx.get_raw(i + 1))?);
        }
        encode_row(&row).map_err(user_error)
    })?;

    // meshsync_pk(v1 [, v2, ...]) -> canonical primary-key blob
    conn.create_scalar_function("meshsync_pk", -1, pure, |ctx| {
        let mut parts = Vec::with_capacity(ctx.len());
        for i in 0..ctx.len() {
            parts.push(value_from_sql(ctx.get_raw(i))?);
        }
        encode_pk(&parts).map_err(user_error)
    })?;

    conn.create_aggregate_function("meshsync_clock", 2, volatile, ClockAggregate)?;

    Ok(())
}

/// Registers functions with fresh state, for tests that talk straight SQL.
#[cfg(test)]
pub(crate) fn register_for_tests(conn: &Connection) {
    register(
        conn,
        Arc::new(Mutex::new(HlcClock::new())),
        Arc::new(AtomicBool::new(true)),
        Arc::new(AtomicBool::new(true)),
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_codec::{decode_pk, decode_row};
    use meshsync_protocol::VectorClock;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_for_tests(&conn);
        conn
    }

    #[test]
    fn op_id_is_sixteen_bytes_and_unique() {
        let conn = conn();
        let a: Vec<u8> = conn
            .query_row("SELECT meshsync_op_id()", [], |r| r.get(0))
            .unwrap();
        let b: Vec<u8> = conn
            .query_row("SELECT meshsync_op_id()", [], |r| r.get(0))
            .unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn hlc_values_advance() {
        let conn = conn();
        let a: String = conn
            .query_row("SELECT meshsync_hlc()", [], |r| r.get(0))
            .unwrap();
        let b: String = conn
            .query_row("SELECT meshsync_hlc()", [], |r| r.get(0))
            .unwrap();
        use meshsync_protocol::Hlc;
        assert!(Hlc::parse(&a).unwrap() < Hlc::parse(&b).unwrap());
    }

    #[test]
    fn row_function_packs_all_sql_types() {
        let conn = conn();
        let blob: Vec<u8> = conn
            .query_row(
                "SELECT meshsync_row('i', 42, 'r', 1.5, 't', 'x', 'b', x'0102', 'n', NULL)",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let row = decode_row(&blob).unwrap();
        assert_eq!(row["i"], Value::Integer(42));
        assert_eq!(row["r"], Value::Real(1.5));
        assert_eq!(row["t"], Value::text("x"));
        assert_eq!(row["b"], Value::Bytes(vec![1, 2]));
        assert_eq!(row["n"], Value::Null);
    }

    #[test]
    fn row_function_rejects_odd_arity() {
        let conn = conn();
        assert!(conn
            .query_row("SELECT meshsync_row('only-a-name')", [], |r| r
                .get::<_, Vec<u8>>(0))
            .is_err());
    }

    #[test]
    fn pk_function_matches_codec() {
        let conn = conn();
        let single: Vec<u8> = conn
            .query_row("SELECT meshsync_pk(7)", [], |r| r.get(0))
            .unwrap();
        assert_eq!(decode_pk(&single).unwrap(), vec![Value::Integer(7)]);

        let composite: Vec<u8> = conn
            .query_row("SELECT meshsync_pk(7, 'en')", [], |r| r.get(0))
            .unwrap();
        assert_eq!(
            decode_pk(&composite).unwrap(),
            vec![Value::Integer(7), Value::text("en")]
        );
    }

    #[test]
    fn clock_aggregate_encodes_table_contents() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE clocks (device_id BLOB, counter INTEGER);
             INSERT INTO clocks VALUES (x'01010101010101010101010101010101', 3);
             INSERT INTO clocks VALUES (x'02020202020202020202020202020202', 0);
             INSERT INTO clocks VALUES (x'03030303030303030303030303030303', 9);",
        )
        .unwrap();
        let blob: Vec<u8> = conn
            .query_row(
                "SELECT meshsync_clock(device_id, counter) FROM clocks",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let clock = VectorClock::decode(&blob).unwrap();
        assert_eq!(clock.len(), 2); // the zero counter is omitted
        assert_eq!(
            clock.counter_for(&meshsync_protocol::DeviceId::from_bytes([3; 16])),
            9
        );
    }

    #[test]
    fn gates_report_their_flags() {
        let conn = Connection::open_in_memory().unwrap();
        let gate = Arc::new(AtomicBool::new(true));
        register(
            &conn,
            Arc::new(Mutex::new(HlcClock::new())),
            gate.clone(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        let on: i64 = conn
            .query_row("SELECT meshsync_capture_on()", [], |r| r.get(0))
            .unwrap();
        assert_eq!(on, 1);
        gate.store(false, Ordering::SeqCst);
        let off: i64 = conn
            .query_row("SELECT meshsync_capture_on()", [], |r| r.get(0))
            .unwrap();
        assert_eq!(off, 0);
    }
}
