//! Change capture: trigger installation for opted-in tables.
//!
//! Three AFTER triggers per table turn every row mutation into a log entry
//! inside the user's own transaction: the local vector-clock row is bumped
//! first, then a complete operation row is built from the `meshsync_*` SQL
//! functions. If the user's statement rolls back, both disappear with it.

use meshsync_codec::{decode_value, encode_value, Value};
use rusqlite::Connection;

use crate::error::{EngineError, EngineResult};
use crate::functions::now_micros;
use crate::schema::RESERVED_TABLES;

/// Shared SELECT list for the operation row a trigger inserts.
/// `{pk}`, `{old}`, `{new}` and `{table}`/`{op}` are substituted per trigger.
const CAPTURE_BODY: &str = "
    UPDATE sync_vector_clock SET counter = counter + 1
        WHERE device_id = (SELECT device_id FROM sync_device);
    INSERT INTO sync_operations (
        op_id, device_id, parent_op_id, vector_clock, hlc, table_name,
        op_type, row_pk, old_values, new_values, schema_version,
        device_counter, created_at, is_local, applied_at
    )
    SELECT
        meshsync_op_id(),
        (SELECT device_id FROM sync_device),
        (SELECT op_id FROM sync_operations
            WHERE is_local = 1 ORDER BY device_counter DESC LIMIT 1),
        (SELECT meshsync_clock(device_id, counter) FROM sync_vector_clock),
        meshsync_hlc(),
        '{table}',
        '{op}',
        {pk},
        {old},
        {new},
        (SELECT schema_version FROM sync_enabled_tables WHERE table_name = '{table}'),
        (SELECT counter FROM sync_vector_clock
            WHERE device_id = (SELECT device_id FROM sync_device)),
        meshsync_now(),
        1,
        meshsync_now();
";

/// Column layout of an opted-in table, read via `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableInfo {
    /// All columns in declaration order.
    pub columns: Vec<String>,
    /// Primary-key columns in key order.
    pub pk_columns: Vec<String>,
}

/// Introspects a user table.
pub(crate) fn table_info(conn: &Connection, table: &str) -> EngineResult<TableInfo> {
    validate_table_name(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Err(EngineError::validation(format!(
            "table '{table}' does not exist"
        )));
    }

    let columns = rows.iter().map(|(name, _)| name.clone()).collect();
    let mut keyed: Vec<(i64, String)> = rows
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, pk)| (pk, name))
        .collect();
    keyed.sort();
    let pk_columns: Vec<String> = keyed.into_iter().map(|(_, name)| name).collect();

    if pk_columns.is_empty() {
        return Err(EngineError::validation(format!(
            "table '{table}' has no primary key; replication requires one"
        )));
    }

    Ok(TableInfo {
        columns,
        pk_columns,
    })
}

/// Rejects names that are reserved or could smuggle SQL into the templates.
pub(crate) fn validate_table_name(table: &str) -> EngineResult<()> {
    if table.is_empty() {
        return Err(EngineError::validation("table name is empty"));
    }
    if RESERVED_TABLES.contains(&table) || table.starts_with("sync_") {
        return Err(EngineError::validation(format!(
            "'{table}' is reserved for the engine"
        )));
    }
    let mut chars = table.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::validation(format!(
            "table name '{table}' contains unsupported characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_column_name(column: &str) -> EngineResult<()> {
    let mut chars = column.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::validation(format!(
            "column name '{column}' contains unsupported characters"
        )));
    }
    Ok(())
}

fn pk_expr(prefix: &str, info: &TableInfo) -> String {
    let args: Vec<String> = info
        .pk_columns
        .iter()
        .map(|col| format!("{prefix}.\"{col}\""))
        .collect();
    format!("meshsync_pk({})", args.join(", "))
}

fn row_expr(prefix: &str, info: &TableInfo) -> String {
    let args: Vec<String> = info
        .columns
        .iter()
        .map(|col| format!("'{col}', {prefix}.\"{col}\""))
        .collect();
    format!("meshsync_row({})", args.join(", "))
}

fn trigger_sql(table: &str, info: &TableInfo, event: &str) -> String {
    let (op, suffix, pk, old, new) = match event {
        "INSERT" => (
            "INSERT",
            "insert",
            pk_expr("NEW", info),
            "NULL".to_string(),
            row_expr("NEW", info),
        ),
        "UPDATE" => (
            "UPDATE",
            "update",
            pk_expr("NEW", info),
            row_expr("OLD", info),
            row_expr("NEW", info),
        ),
        _ => (
            "DELETE",
            "delete",
            pk_expr("OLD", info),
            row_expr("OLD", info),
            "NULL".to_string(),
        ),
    };

    let body = CAPTURE_BODY
        .replace("{table}", table)
        .replace("{op}", op)
        .replace("{pk}", &pk)
        .replace("{old}", &old)
        .replace("{new}", &new);

    format!(
        "CREATE TRIGGER IF NOT EXISTS \"{table}_meshsync_{suffix}\"\n\
         AFTER {event} ON \"{table}\"\n\
         FOR EACH ROW\n\
         WHEN meshsync_capture_on() = 1\n\
         BEGIN\n{body}\nEND;"
    )
}

/// Installs the three capture triggers for a table.
pub(crate) fn install_triggers(
    conn: &Connection,
    table: &str,
    info: &TableInfo,
) -> EngineResult<()> {
    for column in &info.columns {
        validate_column_name(column)?;
    }
    for event in ["INSERT", "UPDATE", "DELETE"] {
        conn.execute_batch(&trigger_sql(table, info, event))?;
    }
    Ok(())
}

/// Drops the capture triggers for a table (before reinstalling after a
/// migration, or when sync is disabled).
pub(crate) fn drop_triggers(conn: &Connection, table: &str) -> EngineResult<()> {
    validate_table_name(table)?;
    for suffix in ["insert", "update", "delete"] {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS \"{table}_meshsync_{suffix}\";"
        ))?;
    }
    Ok(())
}

/// True if all three capture triggers exist for the table.
pub(crate) fn has_triggers(conn: &Connection, table: &str) -> EngineResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master
         WHERE type = 'trigger' AND name IN (?1, ?2, ?3)",
        rusqlite::params![
            format!("{table}_meshsync_insert"),
            format!("{table}_meshsync_update"),
            format!("{table}_meshsync_delete"),
        ],
        |row| row.get(0),
    )?;
    Ok(count == 3)
}

/// Records a table opt-in. Returns the stored table info.
pub(crate) fn record_enabled(
    conn: &Connection,
    table: &str,
    info: &TableInfo,
) -> EngineResult<()> {
    let pk_blob = encode_value(&Value::Array(
        info.pk_columns
            .iter()
            .map(|c| Value::text(c.clone()))
            .collect(),
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO sync_enabled_tables
            (table_name, pk_columns, schema_version, enabled_at)
         VALUES (?1, ?2, 1, ?3)",
        rusqlite::params![table, pk_blob, now_micros()],
    )?;
    Ok(())
}

/// Loads the opt-in record for a table: `(pk_columns, schema_version)`.
pub(crate) fn enabled_table(
    conn: &Connection,
    table: &str,
) -> EngineResult<Option<(Vec<String>, i64)>> {
    use rusqlite::OptionalExtension;
    let row: Option<(Vec<u8>, i64)> = conn
        .query_row(
            "SELECT pk_columns, schema_version FROM sync_enabled_tables WHERE table_name = ?1",
            [table],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((blob, version)) => {
            let value = decode_value(&blob)?;
            let columns = value
                .as_array()
                .ok_or_else(|| EngineError::validation("corrupt pk_columns record"))?
                .iter()
                .map(|v| {
                    v.as_text()
                        .map(str::to_string)
                        .ok_or_else(|| EngineError::validation("corrupt pk_columns record"))
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(Some((columns, version)))
        }
    }
}

/// All opted-in tables.
pub(crate) fn enabled_tables(conn: &Connection) -> EngineResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT table_name FROM sync_enabled_tables ORDER BY table_name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device, functions, log, schema};
    use meshsync_codec::{decode_pk, decode_row, Value};

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
        conn
    }

    fn enable(conn: &Connection, table: &str) {
        let info = table_info(conn, table).unwrap();
        record_enabled(conn, table, &info).unwrap();
        install_triggers(conn, table, &info).unwrap();
    }

    #[test]
    fn table_names_are_validated() {
        assert!(validate_table_name("todos").is_ok());
        assert!(validate_table_name("_private").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("sync_operations").is_err());
        assert!(validate_table_name("sync_anything").is_err());
        assert!(validate_table_name("t; DROP TABLE x").is_err());
        assert!(validate_table_name("1table").is_err());
    }

    #[test]
    fn table_info_requires_a_primary_key() {
        let conn = setup();
        conn.execute_batch("CREATE TABLE nopk (a TEXT)").unwrap();
        assert!(matches!(
            table_info(&conn, "nopk"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            table_info(&conn, "missing"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn insert_is_captured_with_full_row() {
        let conn = setup();
        enable(&conn, "todos");

        conn.execute(
            "INSERT INTO todos (id, title, done) VALUES (1, 'buy milk', 0)",
            [],
        )
        .unwrap();

        let ops = log::get_new_operations(&conn, &Default::default()).unwrap();
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type.as_str(), "INSERT");
        assert_eq!(op.table_name, "todos");
        assert!(op.is_local);
        assert_eq!(op.device_counter(), 1);
        assert!(op.parent_op_id.is_none());
        assert_eq!(decode_pk(&op.row_pk).unwrap(), vec![Value::Integer(1)]);

        let row = decode_row(op.new_values.as_ref().unwrap()).unwrap();
        assert_eq!(row["title"], Value::text("buy milk"));
        assert_eq!(row["done"], Value::Integer(0));
        assert!(op.old_values.is_none());
    }

    #[test]
    fn update_and_delete_capture_old_values_and_chain() {
        let conn = setup();
        enable(&conn, "todos");

        conn.execute("INSERT INTO todos VALUES (1, 'a', 0)", []).unwrap();
        conn.execute("UPDATE todos SET title = 'b' WHERE id = 1", [])
            .unwrap();
        conn.execute("DELETE FROM todos WHERE id = 1", []).unwrap();

        let ops = log::get_new_operations(&conn, &Default::default()).unwrap();
        assert_eq!(ops.len(), 3);
        let (insert, update, delete) = (&ops[0], &ops[1], &ops[2]);

        assert_eq!(update.op_type.as_str(), "UPDATE");
        assert_eq!(update.parent_op_id, Some(insert.op_id));
        let old = decode_row(update.old_values.as_ref().unwrap()).unwrap();
        assert_eq!(old["title"], Value::text("a"));
        let new = decode_row(update.new_values.as_ref().unwrap()).unwrap();
        assert_eq!(new["title"], Value::text("b"));

        assert_eq!(delete.op_type.as_str(), "DELETE");
        assert_eq!(delete.parent_op_id, Some(update.op_id));
        assert!(delete.new_values.is_none());
        assert_eq!(delete.device_counter(), 3);

        // The clock advanced once per statement.
        let clock = log::load_clock(&conn).unwrap();
        assert_eq!(clock.iter().map(|(_, c)| *c).sum::<u64>(), 3);
    }

    #[test]
    fn rollback_discards_capture() {
        let mut conn = setup();
        enable(&conn, "todos");

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO todos VALUES (5, 'oops', 0)", [])
            .unwrap();
        drop(tx); // rollback

        assert_eq!(log::count_operations(&conn).unwrap(), 0);
        let clock = log::load_clock(&conn).unwrap();
        assert!(clock.is_empty());
    }

    #[test]
    fn triggers_install_and_drop() {
        let conn = setup();
        enable(&conn, "todos");
        assert!(has_triggers(&conn, "todos").unwrap());
        drop_triggers(&conn, "todos").unwrap();
        assert!(!has_triggers(&conn, "todos").unwrap());
    }

    #[test]
    fn enabled_table_roundtrips_pk_columns() {
        let conn = setup();
        conn.execute_batch(
            "CREATE TABLE pages (book_id INTEGER, page INTEGER, body TEXT,
                                 PRIMARY KEY (book_id, page))",
        )
        .unwrap();
        enable(&conn, "pages");

        let (pk, version) = enabled_table(&conn, "pages").unwrap().unwrap();
        assert_eq!(pk, vec!["book_id".to_string(), "page".to_string()]);
        assert_eq!(version, 1);
        assert!(enabled_table(&conn, "other").unwrap().is_none());
        assert_eq!(enabled_tables(&conn).unwrap(), vec!["pages".to_string()]);
    }

    #[test]
    fn composite_pk_capture() {
        let conn = setup();
        conn.execute_batch(
            "CREATE TABLE pages (book_id INTEGER, page INTEGER, body TEXT,
                                 PRIMARY KEY (book_id, page))",
        )
        .unwrap();
        enable(&conn, "pages");

        conn.execute("INSERT INTO pages VALUES (7, 2, 'text')", [])
            .unwrap();
        let ops = log::get_new_operations(&conn, &Default::default()).unwrap();
        assert_eq!(
            decode_pk(&ops[0].row_pk).unwrap(),
            vec![Value::Integer(7), Value::Integer(2)]
        );
    }
}
