//! Bundle container files.
//!
//! A bundle is itself a small SQLite database with three tables:
//! `bundle_manifest`, `bundle_operations` (same shape as the log) and
//! `bundle_schema_snapshot`. Files are written to a temp path and
//! atomically renamed into place, so a half-written bundle is never
//! visible under its final name.

use std::path::Path;

use meshsync_protocol::{
    sort_deterministic, BundleId, BundleManifest, DeviceId, Operation, SchemaSnapshot,
    VectorClock, BUNDLE_FORMAT_VERSION,
};
use rusqlite::{Connection, OpenFlags};

use crate::error::{EngineError, EngineResult};
use crate::log;

const BUNDLE_SCHEMA: &str = "
CREATE TABLE bundle_manifest (
    bundle_id BLOB PRIMARY KEY CHECK (length(bundle_id) = 16),
    source_device_id BLOB NOT NULL CHECK (length(source_device_id) = 16),
    peer_device_id BLOB NOT NULL CHECK (length(peer_device_id) = 16),
    created_at INTEGER NOT NULL,
    format_version INTEGER NOT NULL,
    op_count INTEGER NOT NULL,
    causal_summary_blob BLOB NOT NULL,
    sha256 BLOB NOT NULL CHECK (length(sha256) = 32)
) STRICT;

CREATE TABLE bundle_operations (
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
    device_counter INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    is_local INTEGER NOT NULL,
    applied_at INTEGER
) STRICT;

CREATE TABLE bundle_schema_snapshot (
    table_name TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    columns_blob BLOB NOT NULL
) STRICT;
";

/// Writes a sealed bundle to `out_path` via temp-file + atomic rename.
pub(crate) fn write_bundle(
    manifest: &BundleManifest,
    ops: &[Operation],
    snapshots: &[SchemaSnapshot],
    out_path: &Path,
) -> EngineResult<()> {
    let dir = out_path.parent().unwrap_or_else(|| Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".meshsync-bundle-")
        .tempfile_in(dir)?;

    {
        let conn = Connection::open(temp.path())?;
        conn.execute_batch(BUNDLE_SCHEMA)?;

        conn.execute(
            "INSERT INTO bundle_manifest (
                bundle_id, source_device_id, peer_device_id, created_at,
                format_version, op_count, causal_summary_blob, sha256
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                manifest.bundle_id.as_bytes(),
                manifest.source_device_id.as_bytes(),
                manifest.peer_device_id.as_bytes(),
                manifest.created_at,
                manifest.format_version,
                manifest.op_count,
                manifest.causal_summary.encode()?,
                manifest.sha256,
            ],
        )?;

        let mut stmt = conn.prepare(
            "INSERT INTO bundle_operations (
                op_id, device_id, parent_op_id, vector_clock, hlc, table_name,
                op_type, row_pk, old_values, new_values, schema_version,
                device_counter, created_at, is_local, applied_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, NULL)",
        )?;
        for op in ops {
            stmt.execute(rusqlite::params![
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
            ])?;
        }
        drop(stmt);

        for snapshot in snapshots {
            conn.execute(
                "INSERT INTO bundle_schema_snapshot (table_name, schema_version, columns_blob)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    snapshot.table_name,
                    snapshot.schema_version,
                    snapshot.columns_blob()?,
                ],
            )?;
        }
    }

    temp.persist(out_path)
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

/// Reads a bundle container. Structural problems surface as
/// [`EngineError::Bundle`]; the integrity hash is checked separately by
/// [`verify_bundle`].
pub(crate) fn read_bundle(
    path: &Path,
) -> EngineResult<(BundleManifest, Vec<Operation>, Vec<SchemaSnapshot>)> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| EngineError::bundle(format!("cannot open {}: {e}", path.display())))?;

    let manifest = conn
        .query_row(
            "SELECT bundle_id, source_device_id, peer_device_id, created_at,
                    format_version, op_count, causal_summary_blob, sha256
             FROM bundle_manifest",
            [],
            |row| {
                Ok((
                    row.get::<_, [u8; 16]>(0)?,
                    row.get::<_, [u8; 16]>(1)?,
                    row.get::<_, [u8; 16]>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                    row.get::<_, [u8; 32]>(7)?,
                ))
            },
        )
        .map_err(|e| EngineError::bundle(format!("missing or corrupt manifest: {e}")))?;

    let (bundle_id, source, peer, created_at, format_version, op_count, summary_blob, sha256) =
        manifest;
    let manifest = BundleManifest {
        bundle_id: BundleId::from_bytes(bundle_id),
        source_device_id: DeviceId::from_bytes(source),
        peer_device_id: DeviceId::from_bytes(peer),
        created_at,
        format_version,
        op_count,
        causal_summary: VectorClock::decode(&summary_blob)?,
        sha256,
    };

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM bundle_operations",
            log::OP_COLUMNS
        ))
        .map_err(|e| EngineError::bundle(format!("missing operations table: {e}")))?;
    let mut ops: Vec<Operation> = stmt
        .query_map([], log::operation_from_row)
        .map_err(|e| EngineError::bundle(e.to_string()))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| EngineError::bundle(format!("corrupt operation row: {e}")))?;
    for op in &mut ops {
        op.is_local = false;
        op.applied_at = None;
    }
    sort_deterministic(&mut ops);

    let mut stmt = conn
        .prepare("SELECT table_name, schema_version, columns_blob FROM bundle_schema_snapshot")
        .map_err(|e| EngineError::bundle(format!("missing schema snapshot table: {e}")))?;
    let snapshots = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|(table_name, schema_version, blob)| {
            Ok(SchemaSnapshot {
                table_name,
                schema_version,
                columns: SchemaSnapshot::columns_from_blob(&blob)?,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok((manifest, ops, snapshots))
}

/// Checks the container's format version and integrity hash.
pub(crate) fn verify_bundle(manifest: &BundleManifest, ops: &[Operation]) -> EngineResult<()> {
    if manifest.format_version != BUNDLE_FORMAT_VERSION {
        return Err(EngineError::bundle(format!(
            "unsupported bundle format {}",
            manifest.format_version
        )));
    }
    if manifest.op_count != ops.len() as i64 {
        return Err(EngineError::bundle(format!(
            "manifest claims {} ops, container holds {}",
            manifest.op_count,
            ops.len()
        )));
    }
    if !manifest.verify(ops)? {
        return Err(EngineError::bundle("content hash mismatch"));
    }
    Ok(())
}
