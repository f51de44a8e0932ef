//! Internal sync tables.
//!
//! All state the engine persists lives in `sync_*` tables (plus
//! `imported_bundles`) inside the user's own database file, so a single
//! transaction can cover user rows, log rows and bookkeeping together.
//! Tables are STRICT with length checks on every 16-byte id.

use rusqlite::Connection;

use crate::error::EngineResult;

/// The operation log. Rows are immutable once written; only `applied_at`
/// may be filled in later, enforced by the guard triggers below.
const SYNC_OPERATIONS: &str = "
CREATE TABLE IF NOT EXISTS sync_operations (
    op_id BLOB PRIMARY KEY CHECK (length(op_id) = 16),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    parent_op_id BLOB CHECK (parent_op_id IS NULL OR length(parent_op_id) = 16),
    vector_clock BLOB NOT NULL,
    hlc TEXT NOT NULL,
    table_name TEXT NOT NULL,
    op_type TEXT NOT NULL
        CHECK (op_type IN ('INSERT', 'UPDATE', 'DELETE', 'SCHEMA_MIGRATION')),
    row_pk BLOB NOT NULL,
    old_values BLOB,
    new_values BLOB,
    schema_version INTEGER NOT NULL,
    device_counter INTEGER NOT NULL CHECK (device_counter > 0),
    created_at INTEGER NOT NULL,
    is_local INTEGER NOT NULL CHECK (is_local IN (0, 1)),
    applied_at INTEGER
) STRICT;
";

const SYNC_OPERATIONS_INDICES: &str = "
CREATE INDEX IF NOT EXISTS idx_sync_ops_row
    ON sync_operations (table_name, row_pk);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_ops_device_counter
    ON sync_operations (device_id, device_counter);
CREATE INDEX IF NOT EXISTS idx_sync_ops_created
    ON sync_operations (created_at);
";

/// Guard triggers for the append-only invariant. Updates may only touch
/// `applied_at`; deletes are blocked while the log guard is engaged (the
/// compactor disengages it inside its own transaction).
const SYNC_OPERATIONS_GUARDS: &str = "
CREATE TRIGGER IF NOT EXISTS sync_operations_immutable
BEFORE UPDATE ON sync_operations
FOR EACH ROW
WHEN NEW.op_id IS NOT OLD.op_id
    OR NEW.device_id IS NOT OLD.device_id
    OR NEW.parent_op_id IS NOT OLD.parent_op_id
    OR NEW.vector_clock IS NOT OLD.vector_clock
    OR NEW.hlc IS NOT OLD.hlc
    OR NEW.table_name IS NOT OLD.table_name
    OR NEW.op_type IS NOT OLD.op_type
    OR NEW.row_pk IS NOT OLD.row_pk
    OR NEW.old_values IS NOT OLD.old_values
    OR NEW.new_values IS NOT OLD.new_values
    OR NEW.schema_version IS NOT OLD.schema_version
    OR NEW.device_counter IS NOT OLD.device_counter
    OR NEW.created_at IS NOT OLD.created_at
    OR NEW.is_local IS NOT OLD.is_local
BEGIN
    SELECT RAISE(ABORT, 'sync_operations rows are immutable');
END;

CREATE TRIGGER IF NOT EXISTS sync_operations_append_only
BEFORE DELETE ON sync_operations
FOR EACH ROW
WHEN meshsync_log_guard() = 1
BEGIN
    SELECT RAISE(ABORT, 'sync_operations is append-only');
END;
";

/// Node identity, created once. `slot` pins the table to a single row.
const SYNC_DEVICE: &str = "
CREATE TABLE IF NOT EXISTS sync_device (
    slot INTEGER PRIMARY KEY CHECK (slot = 1),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    display_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_hlc TEXT NOT NULL DEFAULT '0:0'
) STRICT;
";

/// The persisted vector clock, one row per known device. Capture triggers
/// bump the local row inside the user's transaction.
const SYNC_VECTOR_CLOCK: &str = "
CREATE TABLE IF NOT EXISTS sync_vector_clock (
    device_id BLOB PRIMARY KEY CHECK (length(device_id) = 16),
    counter INTEGER NOT NULL CHECK (counter >= 0)
) STRICT;
";

/// Tables opted in to replication. Persisting this makes initialisation
/// idempotent: triggers are reinstalled from here on every open.
const SYNC_ENABLED_TABLES: &str = "
CREATE TABLE IF NOT EXISTS sync_enabled_tables (
    table_name TEXT PRIMARY KEY,
    pk_columns BLOB NOT NULL,
    schema_version INTEGER NOT NULL CHECK (schema_version >= 1),
    enabled_at INTEGER NOT NULL
) STRICT;
";

const SYNC_CONFLICTS: &str = "
CREATE TABLE IF NOT EXISTS sync_conflicts (
    conflict_id BLOB PRIMARY KEY CHECK (length(conflict_id) = 16),
    table_name TEXT NOT NULL,
    row_pk BLOB NOT NULL,
    local_op_id BLOB NOT NULL CHECK (length(local_op_id) = 16),
    remote_op_id BLOB NOT NULL CHECK (length(remote_op_id) = 16),
    detected_at INTEGER NOT NULL,
    resolution_state TEXT NOT NULL
        CHECK (resolution_state IN ('unresolved', 'resolved', 'deferred')),
    resolved_by TEXT,
    winning_op_id BLOB CHECK (winning_op_id IS NULL OR length(winning_op_id) = 16)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open
    ON sync_conflicts (detected_at) WHERE resolution_state != 'resolved';
CREATE INDEX IF NOT EXISTS idx_sync_conflicts_row
    ON sync_conflicts (table_name, row_pk);
";

const SYNC_CHECKPOINTS: &str = "
CREATE TABLE IF NOT EXISTS sync_checkpoints (
    checkpoint_id BLOB PRIMARY KEY CHECK (length(checkpoint_id) = 16),
    started_at INTEGER NOT NULL,
    last_applied_op_id BLOB
        CHECK (last_applied_op_id IS NULL OR length(last_applied_op_id) = 16),
    vector_clock_at_start BLOB NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('in_progress', 'committed', 'aborted'))
) STRICT;

CREATE INDEX IF NOT EXISTS idx_sync_checkpoints_open
    ON sync_checkpoints (started_at) WHERE status = 'in_progress';
";

const SYNC_SCHEMA_MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS sync_schema_migrations (
    migration_id BLOB PRIMARY KEY CHECK (length(migration_id) = 16),
    table_name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind = 'ADD_COLUMN'),
    column_name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    default_value BLOB,
    from_version INTEGER NOT NULL,
    to_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    applied_at INTEGER
) STRICT;

CREATE INDEX IF NOT EXISTS idx_sync_migrations_table
    ON sync_schema_migrations (table_name, to_version);
";

/// Import audit trail, also the bundle-level idempotency check.
const IMPORTED_BUNDLES: &str = "
CREATE TABLE IF NOT EXISTS imported_bundles (
    bundle_id BLOB PRIMARY KEY CHECK (length(bundle_id) = 16),
    content_hash BLOB NOT NULL UNIQUE CHECK (length(content_hash) = 32),
    source_device_id BLOB NOT NULL CHECK (length(source_device_id) = 16),
    imported_at INTEGER NOT NULL,
    op_count INTEGER NOT NULL,
    applied_count INTEGER NOT NULL,
    conflict_count INTEGER NOT NULL,
    duplicate_count INTEGER NOT NULL,
    tainted INTEGER NOT NULL DEFAULT 0 CHECK (tainted IN (0, 1))
) STRICT;
";

const SYNC_PEERS: &str = "
CREATE TABLE IF NOT EXISTS sync_peers (
    peer_id BLOB PRIMARY KEY CHECK (length(peer_id) = 16),
    endpoint_hint TEXT,
    last_seen INTEGER,
    last_sync_at INTEGER,
    last_sent_vector_clock BLOB NOT NULL,
    last_received_vector_clock BLOB NOT NULL
) STRICT;
";

/// Table names the engine owns; user tables may not shadow or sync them.
pub const RESERVED_TABLES: &[&str] = &[
    "sync_operations",
    "sync_device",
    "sync_vector_clock",
    "sync_enabled_tables",
    "sync_conflicts",
    "sync_checkpoints",
    "sync_schema_migrations",
    "imported_bundles",
    "sync_peers",
];

/// Creates all internal tables, indices and guard triggers.
///
/// Requires the engine's SQL functions to be registered already (the guard
/// triggers call `meshsync_log_guard`). Safe to call on every open.
pub fn initialize(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(SYNC_OPERATIONS)?;
    conn.execute_batch(SYNC_OPERATIONS_INDICES)?;
    conn.execute_batch(SYNC_OPERATIONS_GUARDS)?;
    conn.execute_batch(SYNC_DEVICE)?;
    conn.execute_batch(SYNC_VECTOR_CLOCK)?;
    conn.execute_batch(SYNC_ENABLED_TABLES)?;
    conn.execute_batch(SYNC_CONFLICTS)?;
    conn.execute_batch(SYNC_CHECKPOINTS)?;
    conn.execute_batch(SYNC_SCHEMA_MIGRATIONS)?;
    conn.execute_batch(IMPORTED_BUNDLES)?;
    conn.execute_batch(SYNC_PEERS)?;
    Ok(())
}
