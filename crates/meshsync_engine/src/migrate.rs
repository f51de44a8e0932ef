//! Additive schema evolution.
//!
//! The only first-class migration is ADD_COLUMN with a default. A local
//! migration alters the table, bumps its version, records itself in
//! `sync_schema_migrations` and emits a SCHEMA_MIGRATION op; peers replay
//! that op before any data op referencing the new version (guaranteed by
//! the deterministic order) and converge on the same schema.

use meshsync_codec::{decode_value, encode_value, CodecError, Value};
use meshsync_protocol::Operation;
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::capture;
use crate::error::{EngineError, EngineResult};
use crate::functions::now_micros;

/// Column types a migration may add.
const ALLOWED_TYPES: &[&str] = &["INTEGER", "REAL", "TEXT", "BLOB", "ANY"];

/// One additive migration.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    /// Unique id; equal across all peers that applied it.
    pub migration_id: [u8; 16],
    /// Table being extended.
    pub table_name: String,
    /// New column name.
    pub column_name: String,
    /// Declared SQL type.
    pub column_type: String,
    /// Default value baked into the DDL, if any.
    pub default_value: Option<Value>,
    /// Table version before.
    pub from_version: i64,
    /// Table version after.
    pub to_version: i64,
    /// Creation wall time, Unix microseconds.
    pub created_at: i64,
}

impl Migration {
    /// Encodes the migration as an op payload.
    pub(crate) fn encode_payload(&self) -> EngineResult<Vec<u8>> {
        let mut pairs = vec![
            (
                Value::text("migration_id"),
                Value::Bytes(self.migration_id.to_vec()),
            ),
            (Value::text("table"), Value::text(self.table_name.clone())),
            (Value::text("column"), Value::text(self.column_name.clone())),
            (Value::text("type"), Value::text(self.column_type.clone())),
            (Value::text("from"), Value::Integer(self.from_version)),
            (Value::text("to"), Value::Integer(self.to_version)),
            (Value::text("created_at"), Value::Integer(self.created_at)),
        ];
        if let Some(default) = &self.default_value {
            pairs.push((Value::text("default"), default.clone()));
        }
        Ok(encode_value(&Value::map(pairs))?)
    }

    /// Decodes an op payload back into a migration.
    pub(crate) fn decode_payload(bytes: &[u8]) -> EngineResult<Self> {
        let value = decode_value(bytes)?;
        let text = |field: &str| -> Result<String, CodecError> {
            value
                .get(field)
                .and_then(Value::as_text)
                .map(str::to_string)
                .ok_or_else(|| CodecError::shape(format!("migration missing {field}")))
        };
        let int = |field: &str| -> Result<i64, CodecError> {
            value
                .get(field)
                .and_then(Value::as_integer)
                .ok_or_else(|| CodecError::shape(format!("migration missing {field}")))
        };
        let migration_id = value
            .get("migration_id")
            .and_then(Value::as_bytes)
            .and_then(|b| <[u8; 16]>::try_from(b).ok())
            .ok_or_else(|| CodecError::shape("migration missing migration_id"))?;

        Ok(Self {
            migration_id,
            table_name: text("table")?,
            column_name: text("column")?,
            column_type: text("type")?,
            default_value: value.get("default").cloned(),
            from_version: int("from")?,
            to_version: int("to")?,
            created_at: int("created_at")?,
        })
    }
}

fn validate(table: &str, column: &str, column_type: &str) -> EngineResult<()> {
    capture::validate_table_name(table)?;
    capture::validate_column_name(column)?;
    let upper = column_type.to_ascii_uppercase();
    if !ALLOWED_TYPES.contains(&upper.as_str()) {
        return Err(EngineError::validation(format!(
            "unsupported column type '{column_type}'"
        )));
    }
    Ok(())
}

fn default_literal(value: &Value) -> EngineResult<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => i64::from(*b).to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => {
            if !f.is_finite() {
                return Err(EngineError::validation("default must be finite"));
            }
            format!("{f:?}")
        }
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
            format!("X'{hex}'")
        }
        Value::Array(_) | Value::Map(_) => {
            return Err(EngineError::validation("default must be a scalar"))
        }
    })
}

fn alter_sql(migration: &Migration) -> EngineResult<String> {
    let mut sql = format!(
        "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
        migration.table_name,
        migration.column_name,
        migration.column_type.to_ascii_uppercase()
    );
    if let Some(default) = &migration.default_value {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_literal(default)?);
    }
    Ok(sql)
}

fn is_recorded(conn: &Connection, migration_id: &[u8; 16]) -> EngineResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_schema_migrations WHERE migration_id = ?1 AND applied_at IS NOT NULL",
            [migration_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn record(conn: &Connection, migration: &Migration, applied_at: i64) -> EngineResult<()> {
    let default_blob = migration
        .default_value
        .as_ref()
        .map(encode_value)
        .transpose()?;
    conn.execute(
        "INSERT OR IGNORE INTO sync_schema_migrations (
            migration_id, table_name, kind, column_name, column_type,
            default_value, from_version, to_version, created_at, applied_at
        ) VALUES (?1, ?2, 'ADD_COLUMN', ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            migration.migration_id,
            migration.table_name,
            migration.column_name,
            migration.column_type,
            default_blob,
            migration.from_version,
            migration.to_version,
            migration.created_at,
            applied_at,
        ],
    )?;
    Ok(())
}

fn bump_version(conn: &Connection, table: &str, to_version: i64) -> EngineResult<()> {
    conn.execute(
        "UPDATE sync_enabled_tables SET schema_version = ?1
         WHERE table_name = ?2 AND schema_version < ?1",
        rusqlite::params![to_version, table],
    )?;
    Ok(())
}

fn reinstall_triggers(conn: &Connection, table: &str) -> EngineResult<()> {
    // Capture triggers enumerate columns, so the new column only replicates
    // after a reinstall.
    capture::drop_triggers(conn, table)?;
    let info = capture::table_info(conn, table)?;
    capture::install_triggers(conn, table, &info)
}

/// Runs a locally-initiated ADD_COLUMN. Returns the migration record; the
/// engine wraps it into a SCHEMA_MIGRATION op.
pub(crate) fn perform_add_column(
    conn: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
    default_value: Option<Value>,
) -> EngineResult<Migration> {
    validate(table, column, column_type)?;
    let Some((_, local_version)) = capture::enabled_table(conn, table)? else {
        return Err(EngineError::validation(format!(
            "table '{table}' is not enabled for sync"
        )));
    };

    let migration = Migration {
        migration_id: meshsync_protocol::OpId::generate().into(),
        table_name: table.to_string(),
        column_name: column.to_string(),
        column_type: column_type.to_ascii_uppercase(),
        default_value,
        from_version: local_version,
        to_version: local_version + 1,
        created_at: now_micros(),
    };

    conn.execute_batch(&alter_sql(&migration)?)?;
    record(conn, &migration, migration.created_at)?;
    bump_version(conn, table, migration.to_version)?;
    reinstall_triggers(conn, table)?;
    info!(
        table,
        column,
        to_version = migration.to_version,
        "schema migration applied locally"
    );
    Ok(migration)
}

/// Replays an imported SCHEMA_MIGRATION op. Idempotent.
pub(crate) fn apply_migration_op(conn: &Connection, op: &Operation) -> EngineResult<()> {
    let payload = op.new_values.as_ref().ok_or_else(|| {
        EngineError::schema(format!("migration op {} has no payload", op.op_id))
    })?;
    let migration = Migration::decode_payload(payload)?;
    validate(
        &migration.table_name,
        &migration.column_name,
        &migration.column_type,
    )?;

    if is_recorded(conn, &migration.migration_id)? {
        return Ok(());
    }

    let Some((_, local_version)) = capture::enabled_table(conn, &migration.table_name)? else {
        warn!(table = %migration.table_name, "migration for a table not opted in; ignored");
        return Ok(());
    };

    if local_version >= migration.to_version {
        // Already at or past this version; just remember the migration.
        record(conn, &migration, now_micros())?;
        return Ok(());
    }
    if migration.from_version != local_version {
        return Err(EngineError::schema(format!(
            "migration {} jumps {}→{} but '{}' is at {}",
            op.op_id,
            migration.from_version,
            migration.to_version,
            migration.table_name,
            local_version
        )));
    }

    match conn.execute_batch(&alter_sql(&migration)?) {
        Ok(()) => {}
        // Another path already added the column; converge silently.
        Err(e) if e.to_string().contains("duplicate column name") => {}
        Err(e) => return Err(e.into()),
    }
    record(conn, &migration, now_micros())?;
    bump_version(conn, &migration.table_name, migration.to_version)?;
    reinstall_triggers(conn, &migration.table_name)?;
    info!(
        table = %migration.table_name,
        column = %migration.column_name,
        to_version = migration.to_version,
        "replicated schema migration applied"
    );
    Ok(())
}

/// Compatibility rule for a remote table version.
///
/// Compatible iff equal, or the remote is behind and every migration in
/// the gap is additive (always true here: only ADD_COLUMN is recordable).
/// A remote that is ahead is incompatible until its migrations arrive.
pub(crate) fn check_compatibility(
    conn: &Connection,
    table: &str,
    remote_version: i64,
) -> EngineResult<bool> {
    let Some((_, local_version)) = capture::enabled_table(conn, table)? else {
        return Ok(false);
    };
    if remote_version == local_version {
        return Ok(true);
    }
    if remote_version < local_version {
        let covered: i64 = conn.query_row(
            "SELECT count(*) FROM sync_schema_migrations
             WHERE table_name = ?1 AND from_version >= ?2 AND to_version <= ?3",
            rusqlite::params![table, remote_version, local_version],
            |row| row.get(0),
        )?;
        return Ok(covered >= local_version - remote_version);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device, functions, log, schema};
    use meshsync_protocol::{DeviceId, Hlc, OpId, OpType, VectorClock};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        functions::register_for_tests(&conn);
        schema::initialize(&conn).unwrap();
        let dev = device::load_or_create(&conn, None).unwrap();
        log::ensure_clock_row(&conn, &dev.device_id).unwrap();
        conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)")
            .unwrap();
        let info = capture::table_info(&conn, "todos").unwrap();
        capture::record_enabled(&conn, "todos", &info).unwrap();
        capture::install_triggers(&conn, "todos", &info).unwrap();
        conn
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        capture::table_info(conn, table).unwrap().columns
    }

    #[test]
    fn payload_roundtrip() {
        let migration = Migration {
            migration_id: [7; 16],
            table_name: "todos".into(),
            column_name: "priority".into(),
            column_type: "INTEGER".into(),
            default_value: Some(Value::Integer(0)),
            from_version: 1,
            to_version: 2,
            created_at: 42,
        };
        let payload = migration.encode_payload().unwrap();
        assert_eq!(Migration::decode_payload(&payload).unwrap(), migration);
    }

    #[test]
    fn add_column_alters_bumps_and_records() {
        let conn = setup();
        let migration =
            perform_add_column(&conn, "todos", "priority", "integer", Some(Value::Integer(0)))
                .unwrap();

        assert_eq!(migration.from_version, 1);
        assert_eq!(migration.to_version, 2);
        assert!(column_names(&conn, "todos").contains(&"priority".to_string()));
        let (_, version) = capture::enabled_table(&conn, "todos").unwrap().unwrap();
        assert_eq!(version, 2);
        assert!(is_recorded(&conn, &migration.migration_id).unwrap());

        // New column flows into capture after the trigger reinstall.
        conn.execute("INSERT INTO todos (id, title, priority) VALUES (1, 'x', 9)", [])
            .unwrap();
        let ops = log::get_new_operations(&conn, &VectorClock::new()).unwrap();
        let row = meshsync_codec::decode_row(ops[0].new_values.as_ref().unwrap()).unwrap();
        assert_eq!(row["priority"], Value::Integer(9));
    }

    #[test]
    fn add_column_rejects_bad_input() {
        let conn = setup();
        assert!(perform_add_column(&conn, "todos", "p", "FANCY", None).is_err());
        assert!(perform_add_column(&conn, "todos", "bad name", "TEXT", None).is_err());
        assert!(perform_add_column(&conn, "missing", "p", "TEXT", None).is_err());
    }

    fn migration_op(migration: &Migration, counter: u64) -> Operation {
        let device = DeviceId::from_bytes([9; 16]);
        let clock: VectorClock = [(device, counter)].into_iter().collect();
        Operation {
            op_id: OpId::generate_at(counter),
            device_id: device,
            parent_op_id: None,
            vector_clock: clock,
            hlc: Hlc::new(counter, 0),
            table_name: migration.table_name.clone(),
            op_type: OpType::SchemaMigration,
            row_pk: migration.migration_id.to_vec(),
            old_values: None,
            new_values: Some(migration.encode_payload().unwrap()),
            schema_version: migration.to_version,
            created_at: migration.created_at,
            is_local: false,
            applied_at: None,
        }
    }

    #[test]
    fn imported_migration_applies_once() {
        let conn = setup();
        let migration = Migration {
            migration_id: [3; 16],
            table_name: "todos".into(),
            column_name: "priority".into(),
            column_type: "INTEGER".into(),
            default_value: Some(Value::Integer(0)),
            from_version: 1,
            to_version: 2,
            created_at: 42,
        };
        let op = migration_op(&migration, 1);

        apply_migration_op(&conn, &op).unwrap();
        assert!(column_names(&conn, "todos").contains(&"priority".to_string()));
        let (_, version) = capture::enabled_table(&conn, "todos").unwrap().unwrap();
        assert_eq!(version, 2);

        // Idempotent.
        apply_migration_op(&conn, &op).unwrap();
        assert_eq!(
            column_names(&conn, "todos")
                .iter()
                .filter(|c| *c == "priority")
                .count(),
            1
        );
    }

    #[test]
    fn version_gap_is_a_schema_error() {
        let conn = setup();
        let migration = Migration {
            migration_id: [4; 16],
            table_name: "todos".into(),
            column_name: "later".into(),
            column_type: "TEXT".into(),
            default_value: None,
            from_version: 5,
            to_version: 6,
            created_at: 42,
        };
        let err = apply_migration_op(&conn, &migration_op(&migration, 1)).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));
    }

    #[test]
    fn compatibility_rules() {
        let conn = setup();
        assert!(check_compatibility(&conn, "todos", 1).unwrap());
        // Remote ahead: must wait for its migrations.
        assert!(!check_compatibility(&conn, "todos", 2).unwrap());

        perform_add_column(&conn, "todos", "priority", "INTEGER", Some(Value::Integer(0)))
            .unwrap();
        // Remote behind by one additive migration: fine.
        assert!(check_compatibility(&conn, "todos", 1).unwrap());
        assert!(check_compatibility(&conn, "todos", 2).unwrap());
        // Unknown table: incompatible.
        assert!(!check_compatibility(&conn, "nope", 1).unwrap());
    }

    #[test]
    fn default_literals() {
        assert_eq!(default_literal(&Value::Integer(5)).unwrap(), "5");
        assert_eq!(default_literal(&Value::text("o'clock")).unwrap(), "'o''clock'");
        assert_eq!(default_literal(&Value::Bytes(vec![0xab, 0x01])).unwrap(), "X'ab01'");
        assert_eq!(default_literal(&Value::Null).unwrap(), "NULL");
        assert!(default_literal(&Value::Array(vec![])).is_err());
    }
}
