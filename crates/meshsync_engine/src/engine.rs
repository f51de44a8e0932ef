//! The engine façade.
//!
//! One [`SyncEngine`] per database file. It owns the connection (all
//! captures and applies serialise through it), the device identity, the
//! HLC generator and the configured resolver. Methods take `&self`; the
//! connection sits behind a mutex so the engine is `Send + Sync`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meshsync_codec::{encode_pk, Value};
use meshsync_protocol::{
    sort_deterministic, BundleId, BundleManifest, ConflictId, ConflictRecord, DeviceId, HlcClock,
    OpId, Operation, OpType, SchemaSnapshot, VectorClock,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::apply::{self, BatchOutcome};
use crate::compact::CompactionOutcome;
use crate::config::EngineConfig;
use crate::device::{self, Device};
use crate::error::{EngineError, EngineResult};
use crate::functions::now_micros;
use crate::migrate::Migration;
use crate::peers::Peer;
use crate::resolve::{ConflictContext, Resolution, ResolverStrategy};
use crate::{bundle, capture, checkpoint, compact, conflicts, functions, log, migrate, peers,
            schema};

/// Result of importing one bundle file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    /// The bundle's id.
    pub bundle_id: BundleId,
    /// Device that generated it.
    pub source_device_id: DeviceId,
    /// Operations carried by the bundle.
    pub total_operations: usize,
    /// Operations replayed this import.
    pub applied_count: usize,
    /// Fresh conflict records.
    pub conflict_count: usize,
    /// Operations discarded as already known.
    pub duplicate_count: usize,
    /// True when the bundle had been imported before; nothing was done.
    pub skipped: bool,
}

/// Snapshot of engine state for status displays.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// This node's id.
    pub device_id: DeviceId,
    /// This node's display name.
    pub device_name: String,
    /// Current vector clock.
    pub vector_clock: VectorClock,
    /// Rows in the operation log.
    pub operation_count: i64,
    /// Tables opted in to replication.
    pub enabled_tables: Vec<String>,
    /// Conflicts awaiting a decision.
    pub unresolved_conflicts: usize,
    /// Peers this node has exchanged with.
    pub peer_count: usize,
}

/// RAII flip of an atomic gate; restores the previous value on drop.
struct GateGuard<'a> {
    gate: &'a AtomicBool,
    prev: bool,
}

impl<'a> GateGuard<'a> {
    fn set(gate: &'a AtomicBool, value: bool) -> Self {
        let prev = gate.swap(value, Ordering::SeqCst);
        Self { gate, prev }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.store(self.prev, Ordering::SeqCst);
    }
}

/// A replication node over one SQLite database.
pub struct SyncEngine {
    conn: Mutex<Connection>,
    device: Device,
    hlc: Arc<Mutex<HlcClock>>,
    capture_gate: Arc<AtomicBool>,
    log_guard: Arc<AtomicBool>,
    cancelled: AtomicBool,
    resolver: ResolverStrategy,
}

impl SyncEngine {
    /// Opens (and on first use initialises) a database as a sync node.
    ///
    /// Idempotent: the device identity, internal tables and capture
    /// triggers for previously opted-in tables are created or re-attached
    /// as needed. Any import interrupted by a crash is recovered here.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let conn = Connection::open(&config.db_path)?;
        conn.busy_timeout(config.busy_timeout)?;
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let hlc = Arc::new(Mutex::new(HlcClock::new()));
        let capture_gate = Arc::new(AtomicBool::new(true));
        let log_guard = Arc::new(AtomicBool::new(true));
        functions::register(&conn, hlc.clone(), capture_gate.clone(), log_guard.clone())?;

        schema::initialize(&conn)?;
        let device = device::load_or_create(&conn, config.device_name.as_deref())?;
        log::ensure_clock_row(&conn, &device.device_id)?;

        // Restore HLC monotonicity across restarts: resume past both the
        // persisted watermark and the local chain head's stamp.
        let mut last = device::load_last_hlc(&conn)?;
        if let Some(head) = log::local_head(&conn)? {
            last = last.max(head.hlc);
        }
        *hlc.lock() = HlcClock::resume(last);

        let recovered = checkpoint::recover(&conn)?;
        if recovered > 0 {
            info!(recovered, "aborted interrupted imports from a previous run");
        }

        // Re-attach triggers for every opted-in table.
        for table in capture::enabled_tables(&conn)? {
            match capture::table_info(&conn, &table) {
                Ok(info) => capture::install_triggers(&conn, &table, &info)?,
                Err(e) => warn!(table, error = %e, "enabled table missing; triggers not installed"),
            }
        }

        info!(device = %device.device_id, db = %config.db_path.display(), "engine open");
        Ok(Self {
            conn: Mutex::new(conn),
            device,
            hlc,
            capture_gate,
            log_guard,
            cancelled: AtomicBool::new(false),
            resolver: config.resolver,
        })
    }

    /// This node's device id.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device.device_id
    }

    /// This node's display name.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device.display_name
    }

    /// Runs a closure against the engine's connection.
    ///
    /// This is how the application reads and writes its own tables: writes
    /// through this connection hit the capture triggers, so they replicate.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> EngineResult<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    /// Runs a closure inside one transaction with guaranteed
    /// commit-or-rollback on every exit path: commit on `Ok`, rollback on
    /// `Err` (the dropped transaction rolls back).
    pub fn atomic<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Opts a table in to replication and installs its capture triggers.
    /// Idempotent; the opt-in itself is persisted.
    pub fn enable_sync_for_table(&self, table: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let info = capture::table_info(&conn, table)?;
        capture::record_enabled(&conn, table, &info)?;
        capture::install_triggers(&conn, table, &info)?;
        info!(table, "sync enabled");
        Ok(())
    }

    /// Removes a table's capture triggers and its opt-in record. Already
    /// captured operations stay in the log.
    pub fn disable_sync_for_table(&self, table: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        capture::drop_triggers(&conn, table)?;
        conn.execute(
            "DELETE FROM sync_enabled_tables WHERE table_name = ?1",
            [table],
        )?;
        info!(table, "sync disabled");
        Ok(())
    }

    /// Tables currently opted in.
    pub fn enabled_tables(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        capture::enabled_tables(&conn)
    }

    /// The current vector clock.
    pub fn get_vector_clock(&self) -> EngineResult<VectorClock> {
        let conn = self.conn.lock();
        log::load_clock(&conn)
    }

    /// Operations a peer at `since` still lacks, in deterministic order.
    pub fn get_new_operations(&self, since: &VectorClock) -> EngineResult<Vec<Operation>> {
        let conn = self.conn.lock();
        log::get_new_operations(&conn, since)
    }

    /// Conflicts awaiting a decision, oldest first.
    pub fn get_unresolved_conflicts(&self) -> EngineResult<Vec<ConflictRecord>> {
        let conn = self.conn.lock();
        conflicts::unresolved(&conn)
    }

    /// Known peers.
    pub fn get_peers(&self) -> EngineResult<Vec<Peer>> {
        let conn = self.conn.lock();
        peers::all(&conn)
    }

    /// Registers a peer, optionally with a transport endpoint hint.
    pub fn register_peer(&self, peer_id: &DeviceId, endpoint_hint: Option<&str>) -> EngineResult<()> {
        let conn = self.conn.lock();
        peers::register(&conn, peer_id, endpoint_hint)
    }

    /// Engine state snapshot.
    pub fn status(&self) -> EngineResult<EngineStatus> {
        let conn = self.conn.lock();
        Ok(EngineStatus {
            device_id: self.device.device_id,
            device_name: self.device.display_name.clone(),
            vector_clock: log::load_clock(&conn)?,
            operation_count: log::count_operations(&conn)?,
            enabled_tables: capture::enabled_tables(&conn)?,
            unresolved_conflicts: conflicts::unresolved(&conn)?.len(),
            peer_count: peers::all(&conn)?.len(),
        })
    }

    /// Applies one streamed operation. Returns true if it changed the user
    /// table, false if it was a duplicate, stale shadow or conflict.
    pub fn apply_operation(&self, op: Operation) -> EngineResult<bool> {
        let outcome = self.import_operations(vec![op])?;
        Ok(outcome.applied == 1)
    }

    /// Applies a batch of remote operations through the crash-safe
    /// checkpoint protocol: an `in_progress` checkpoint is committed first,
    /// the batch runs in a single transaction whose last statement flips
    /// the checkpoint to `committed`, and any failure marks it `aborted`
    /// after the rollback.
    pub fn import_operations(&self, ops: Vec<Operation>) -> EngineResult<BatchOutcome> {
        if ops.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut conn = self.conn.lock();
        checkpoint::recover(&conn)?;

        let mut ordered = ops;
        sort_deterministic(&mut ordered);
        let clock = log::load_clock(&conn)?;
        let first = ordered.first().map(|op| op.op_id);
        let cp = checkpoint::create(&conn, &clock, first.as_ref())?;

        let _capture_off = GateGuard::set(&self.capture_gate, false);
        let tx = conn.transaction()?;
        match apply::apply_batch(&tx, &self.resolver, &self.hlc, ordered) {
            Ok(outcome) => {
                checkpoint::mark_committed(&tx, &cp.checkpoint_id)?;
                tx.commit()?;
                debug!(?outcome, "batch committed");
                Ok(outcome)
            }
            Err(e) => {
                drop(tx); // rollback
                checkpoint::mark_aborted(&conn, &cp.checkpoint_id)?;
                warn!(error = %e, "batch rolled back");
                Err(e)
            }
        }
    }

    /// Generates a bundle holding everything `peer_id` has not seen.
    ///
    /// Returns `Ok(None)` when the peer is fully caught up. The file is
    /// written to a temp path and atomically renamed to `out_path`.
    pub fn generate_bundle(
        &self,
        peer_id: &DeviceId,
        out_path: &Path,
    ) -> EngineResult<Option<PathBuf>> {
        let conn = self.conn.lock();

        // Everything the peer has seen: what we last shipped, plus what it
        // has told us about itself.
        let mut seen = VectorClock::new();
        if let Some(peer) = peers::get(&conn, peer_id)? {
            seen.merge(&peer.last_sent_vector_clock);
            seen.merge(&peer.last_received_vector_clock);
        }

        let all = log::get_new_operations(&conn, &VectorClock::new())?;
        let mut ops = Vec::new();
        for (i, op) in all.into_iter().enumerate() {
            if i % 256 == 0 && self.cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            if !seen.dominates(&op.vector_clock) {
                ops.push(op);
            }
        }
        if ops.is_empty() {
            return Ok(None);
        }
        sort_deterministic(&mut ops);

        let tables: std::collections::BTreeSet<String> = ops
            .iter()
            .filter(|op| op.op_type != OpType::SchemaMigration)
            .map(|op| op.table_name.clone())
            .collect();
        let mut snapshots = Vec::new();
        for table in tables {
            if let Some((_, version)) = capture::enabled_table(&conn, &table)? {
                snapshots.push(SchemaSnapshot {
                    table_name: table.clone(),
                    schema_version: version,
                    columns: capture::table_info(&conn, &table)?.columns,
                });
            }
        }

        let current = log::load_clock(&conn)?;
        let mut manifest = BundleManifest::new(
            self.device.device_id,
            *peer_id,
            now_micros(),
            ops.len() as i64,
            current.clone(),
        );
        manifest.seal(&ops)?;
        bundle::write_bundle(&manifest, &ops, &snapshots, out_path)?;
        peers::record_sent(&conn, peer_id, &current)?;
        info!(peer = %peer_id, ops = ops.len(), path = %out_path.display(), "bundle generated");
        Ok(Some(out_path.to_path_buf()))
    }

    /// Imports a bundle file. Idempotent per bundle: a second import of the
    /// same bundle is a no-op reported with `skipped = true`.
    pub fn import_bundle(&self, path: &Path) -> EngineResult<ImportResult> {
        let (manifest, ops, snapshots) = bundle::read_bundle(path)?;

        {
            let conn = self.conn.lock();
            if self.already_imported(&conn, &manifest)? {
                debug!(bundle = %manifest.bundle_id, "bundle already imported");
                return Ok(ImportResult {
                    bundle_id: manifest.bundle_id,
                    source_device_id: manifest.source_device_id,
                    total_operations: ops.len(),
                    applied_count: 0,
                    conflict_count: 0,
                    duplicate_count: 0,
                    skipped: true,
                });
            }
        }

        if let Err(e) = bundle::verify_bundle(&manifest, &ops) {
            let conn = self.conn.lock();
            self.record_import(&conn, &manifest, ops.len(), &BatchOutcome::default(), true)?;
            warn!(bundle = %manifest.bundle_id, error = %e, "bundle tainted");
            return Err(e);
        }

        {
            let conn = self.conn.lock();
            self.check_bundle_schema(&conn, &ops, &snapshots)?;
        }

        let outcome = self.import_operations(ops)?;

        let conn = self.conn.lock();
        self.record_import(&conn, &manifest, outcome.total, &outcome, false)?;
        peers::record_received(&conn, &manifest.source_device_id, &manifest.causal_summary)?;

        Ok(ImportResult {
            bundle_id: manifest.bundle_id,
            source_device_id: manifest.source_device_id,
            total_operations: outcome.total,
            applied_count: outcome.applied,
            conflict_count: outcome.conflicts,
            duplicate_count: outcome.duplicates,
            skipped: false,
        })
    }

    fn already_imported(&self, conn: &Connection, manifest: &BundleManifest) -> EngineResult<bool> {
        use rusqlite::OptionalExtension;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM imported_bundles
                 WHERE (bundle_id = ?1 OR content_hash = ?2) AND tainted = 0",
                rusqlite::params![manifest.bundle_id.as_bytes(), manifest.sha256],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_import(
        &self,
        conn: &Connection,
        manifest: &BundleManifest,
        total: usize,
        outcome: &BatchOutcome,
        tainted: bool,
    ) -> EngineResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO imported_bundles (
                bundle_id, content_hash, source_device_id, imported_at,
                op_count, applied_count, conflict_count, duplicate_count, tainted
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                manifest.bundle_id.as_bytes(),
                manifest.sha256,
                manifest.source_device_id.as_bytes(),
                now_micros(),
                total as i64,
                outcome.applied as i64,
                outcome.conflicts as i64,
                outcome.duplicates as i64,
                i64::from(tainted),
            ],
        )?;
        Ok(())
    }

    /// Rejects a bundle whose data requires table versions beyond what the
    /// bundle itself can migrate us to.
    fn check_bundle_schema(
        &self,
        conn: &Connection,
        ops: &[Operation],
        snapshots: &[SchemaSnapshot],
    ) -> EngineResult<()> {
        for snapshot in snapshots {
            let Some((_, local_version)) = capture::enabled_table(conn, &snapshot.table_name)?
            else {
                continue; // data ops for unknown tables are skip-logged
            };
            if snapshot.schema_version <= local_version {
                continue;
            }
            // The bundle must carry migrations covering every step of the
            // gap, or its data ops can never apply here.
            for version in (local_version + 1)..=snapshot.schema_version {
                let covered = ops.iter().any(|op| {
                    op.op_type == OpType::SchemaMigration
                        && op.table_name == snapshot.table_name
                        && op
                            .new_values
                            .as_deref()
                            .and_then(|payload| Migration::decode_payload(payload).ok())
                            .is_some_and(|m| m.to_version == version)
                });
                if !covered {
                    return Err(EngineError::schema(format!(
                        "bundle requires '{}' at version {} but does not carry the migration to {}",
                        snapshot.table_name, snapshot.schema_version, version
                    )));
                }
            }
        }
        Ok(())
    }

    /// Adds a column to an opted-in table and emits the SCHEMA_MIGRATION
    /// operation that replicates the change to every peer.
    pub fn add_column(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
        default_value: Option<Value>,
    ) -> EngineResult<Migration> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let migration = migrate::perform_add_column(&tx, table, column, column_type, default_value)?;

        let clock = log::increment_clock(&tx, &self.device.device_id)?;
        let parent = log::local_head(&tx)?.map(|op| op.op_id);
        let now = now_micros();
        let op = Operation {
            op_id: OpId::generate(),
            device_id: self.device.device_id,
            parent_op_id: parent,
            vector_clock: clock,
            hlc: self.hlc.lock().tick(),
            table_name: table.to_string(),
            op_type: OpType::SchemaMigration,
            row_pk: encode_pk(&[Value::Bytes(migration.migration_id.to_vec())])?,
            old_values: None,
            new_values: Some(migration.encode_payload()?),
            schema_version: migration.to_version,
            created_at: now,
            is_local: true,
            applied_at: Some(now),
        };
        log::insert_operation(&tx, &op)?;
        tx.commit()?;
        Ok(migration)
    }

    /// Resolves a recorded conflict with an explicit strategy.
    ///
    /// The chosen values are replayed through the live capture path, so the
    /// decision becomes a new local operation that replicates and closes
    /// the conflict on every peer once propagated. A strategy that defers
    /// surfaces [`EngineError::ConflictPending`].
    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        strategy: &ResolverStrategy,
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let record = conflicts::get(&conn, conflict_id)?.ok_or_else(|| {
            EngineError::InvalidState(format!("conflict {conflict_id} not found"))
        })?;
        if !record.is_open() {
            return Err(EngineError::InvalidState(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let local = log::get_operation(&conn, &record.local_op_id)?
            .ok_or_else(|| EngineError::validation("local op missing from log"))?;
        let remote = log::get_operation(&conn, &record.remote_op_id)?
            .ok_or_else(|| EngineError::validation("remote op missing from log"))?;
        let (pk_columns, _) = capture::enabled_table(&conn, &record.table_name)?
            .ok_or_else(|| EngineError::validation("conflicted table is not enabled"))?;

        let current = apply::current_row(&conn, &record.table_name, &pk_columns, &record.row_pk)?;
        let ctx = ConflictContext::build(local.clone(), remote.clone(), current)?;

        let resolution = match strategy.resolve(&ctx) {
            Resolution::Defer => {
                conflicts::mark_deferred(&conn, conflict_id)?;
                return Err(EngineError::ConflictPending {
                    conflict_id: *conflict_id,
                });
            }
            decided => decided,
        };

        let (values, winner) = match &resolution {
            Resolution::KeepLocal => (ctx.local_values.clone(), Some(local.op_id)),
            Resolution::TakeRemote => (ctx.remote_values.clone(), Some(remote.op_id)),
            Resolution::Merge(merged) => (merged.clone(), None),
            Resolution::Defer => unreachable!("handled above"),
        };

        // Capture stays on: the statement below is recorded as a fresh
        // local operation that supersedes both sides once merged clocks
        // propagate.
        let tx = conn.transaction()?;
        if values.is_empty() {
            apply::delete_row(&tx, &record.table_name, &pk_columns, &record.row_pk)?;
        } else if apply::update_row(&tx, &record.table_name, &pk_columns, &record.row_pk, &values)?
            == 0
        {
            apply::write_row(&tx, &record.table_name, &pk_columns, &record.row_pk, &values)?;
        }
        conflicts::mark_resolved(&tx, conflict_id, strategy.name(), winner.as_ref())?;
        tx.commit()?;
        info!(conflict = %conflict_id, strategy = strategy.name(), "conflict resolved");
        Ok(())
    }

    /// Prunes log entries every known peer has acknowledged.
    pub fn compact_log(&self, max_ops: usize) -> EngineResult<CompactionOutcome> {
        let mut conn = self.conn.lock();
        let _guard_off = GateGuard::set(&self.log_guard, false);
        let tx = conn.transaction()?;
        let outcome = compact::compact_log(&tx, max_ops)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Requests cooperative cancellation of bundle generation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a previous cancellation request.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Flushes clock state and releases the connection.
    pub fn close(self) -> EngineResult<()> {
        let conn = self.conn.lock();
        device::store_last_hlc(&conn, self.hlc.lock().last())?;
        Ok(())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // Best-effort watermark flush for paths that skip close().
        let conn = self.conn.lock();
        let _ = device::store_last_hlc(&conn, self.hlc.lock().last());
    }
}
