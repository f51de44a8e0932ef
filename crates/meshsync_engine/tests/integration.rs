//! Two-device end-to-end scenarios.

use std::path::PathBuf;
use std::sync::Arc;

use meshsync_engine::{
    EngineConfig, InProcessTransport, ResolverStrategy, SyncEngine, SyncLoop, SyncLoopConfig,
};
use meshsync_protocol::{DeviceId, VectorClock};
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str, resolver: ResolverStrategy) -> SyncEngine {
    let engine = SyncEngine::open(
        EngineConfig::new(dir.path().join(format!("{name}.db")))
            .with_device_name(name)
            .with_resolver(resolver),
    )
    .unwrap();
    engine
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS todos (
                     id INTEGER PRIMARY KEY,
                     title TEXT,
                     done INTEGER NOT NULL DEFAULT 0
                 )",
            )
        })
        .unwrap();
    engine.enable_sync_for_table("todos").unwrap();
    engine
}

fn insert(engine: &SyncEngine, id: i64, title: &str) {
    engine
        .with_connection(|conn| {
            conn.execute(
                "INSERT INTO todos (id, title) VALUES (?1, ?2)",
                rusqlite::params![id, title],
            )
            .map(|_| ())
        })
        .unwrap();
}

fn update_title(engine: &SyncEngine, id: i64, title: &str) {
    engine
        .with_connection(|conn| {
            conn.execute(
                "UPDATE todos SET title = ?1 WHERE id = ?2",
                rusqlite::params![title, id],
            )
            .map(|_| ())
        })
        .unwrap();
}

fn title_of(engine: &SyncEngine, id: i64) -> Option<String> {
    engine
        .with_connection(|conn| {
            use rusqlite::OptionalExtension;
            conn.query_row("SELECT title FROM todos WHERE id = ?1", [id], |r| r.get(0))
                .optional()
        })
        .unwrap()
}

fn table_dump(engine: &SyncEngine) -> Vec<(i64, Option<String>, i64)> {
    engine
        .with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT id, title, done FROM todos ORDER BY id")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .unwrap()
}

/// One bidirectional bundle exchange.
fn sync_pair(dir: &TempDir, a: &SyncEngine, b: &SyncEngine) {
    let ab: PathBuf = dir.path().join(format!("ab-{}.bundle", rand_tag()));
    if a.generate_bundle(&b.device_id(), &ab).unwrap().is_some() {
        b.import_bundle(&ab).unwrap();
    }
    let ba: PathBuf = dir.path().join(format!("ba-{}.bundle", rand_tag()));
    if b.generate_bundle(&a.device_id(), &ba).unwrap().is_some() {
        a.import_bundle(&ba).unwrap();
    }
}

fn rand_tag() -> String {
    meshsync_protocol::OpId::generate().to_string()
}

#[test]
fn concurrent_inserts_conflict_and_lww_converges() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::LastWriteWins);
    let b = open(&dir, "b", ResolverStrategy::LastWriteWins);

    insert(&a, 1, "A");
    insert(&b, 1, "B");

    sync_pair(&dir, &a, &b);

    // Exactly one conflict record on each side, already resolved by LWW.
    for engine in [&a, &b] {
        assert!(engine.get_unresolved_conflicts().unwrap().is_empty());
        let resolved: i64 = engine
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sync_conflicts WHERE resolution_state = 'resolved'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(resolved, 1);
    }

    // Both sides picked the same winner: the op with the greater
    // (hlc, device_id) pair.
    let ops_a = a.get_new_operations(&VectorClock::new()).unwrap();
    let winner = ops_a
        .iter()
        .max_by_key(|op| (op.hlc, *op.device_id.as_bytes()))
        .unwrap();
    let expected = if winner.device_id == a.device_id() { "A" } else { "B" };
    assert_eq!(title_of(&a, 1).as_deref(), Some(expected));
    assert_eq!(table_dump(&a), table_dump(&b));
}

#[test]
fn causal_chain_carries_no_conflict() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    let b = open(&dir, "b", ResolverStrategy::Manual);

    insert(&a, 1, "original");
    sync_pair(&dir, &a, &b);
    assert_eq!(title_of(&b, 1).as_deref(), Some("original"));

    update_title(&b, 1, "x");
    sync_pair(&dir, &a, &b);

    assert_eq!(title_of(&a, 1).as_deref(), Some("x"));
    assert!(a.get_unresolved_conflicts().unwrap().is_empty());
    assert!(b.get_unresolved_conflicts().unwrap().is_empty());

    // VC = {A:1, B:1} on both sides.
    let clock = a.get_vector_clock().unwrap();
    assert_eq!(clock.counter_for(&a.device_id()), 1);
    assert_eq!(clock.counter_for(&b.device_id()), 1);
    assert_eq!(clock, b.get_vector_clock().unwrap());
}

#[test]
fn importing_a_bundle_three_times_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    let b = open(&dir, "b", ResolverStrategy::Manual);

    for i in 0..5 {
        insert(&a, i, &format!("item {i}"));
    }
    let path = dir.path().join("a.bundle");
    a.generate_bundle(&b.device_id(), &path).unwrap().unwrap();

    let results: Vec<_> = (0..3).map(|_| b.import_bundle(&path).unwrap()).collect();
    assert_eq!(
        results.iter().map(|r| r.applied_count).collect::<Vec<_>>(),
        vec![5, 0, 0]
    );
    assert_eq!(
        results.iter().map(|r| r.skipped).collect::<Vec<_>>(),
        vec![false, true, true]
    );
    assert_eq!(table_dump(&b).len(), 5);
}

#[test]
fn concurrent_update_and_delete_under_manual() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    let b = open(&dir, "b", ResolverStrategy::Manual);

    insert(&a, 1, "base");
    sync_pair(&dir, &a, &b);

    update_title(&a, 1, "updated");
    b.with_connection(|conn| conn.execute("DELETE FROM todos WHERE id = 1", []).map(|_| ()))
        .unwrap();

    sync_pair(&dir, &a, &b);

    // One open conflict on each side; the surviving row is untouched where
    // it survives until an operator decides.
    assert_eq!(a.get_unresolved_conflicts().unwrap().len(), 1);
    assert_eq!(b.get_unresolved_conflicts().unwrap().len(), 1);
    assert_eq!(title_of(&a, 1).as_deref(), Some("updated"));

    // Operator resolves with LWW on both sides; peers converge after the
    // resolution ops propagate.
    for engine in [&a, &b] {
        let open = engine.get_unresolved_conflicts().unwrap();
        engine
            .resolve_conflict(&open[0].conflict_id, &ResolverStrategy::LastWriteWins)
            .unwrap();
    }
    sync_pair(&dir, &a, &b);
    sync_pair(&dir, &a, &b);
    assert_eq!(table_dump(&a), table_dump(&b));
}

#[test]
fn interrupted_import_recovers_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    for i in 0..100 {
        insert(&a, i, &format!("row {i}"));
    }
    let path = dir.path().join("big.bundle");
    let b_id;
    {
        let b = open(&dir, "b", ResolverStrategy::Manual);
        b_id = b.device_id();
        a.generate_bundle(&b_id, &path).unwrap().unwrap();

        // Simulate a crash mid-import: an in_progress checkpoint exists but
        // the batch transaction never committed.
        b.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_checkpoints
                     (checkpoint_id, started_at, last_applied_op_id,
                      vector_clock_at_start, status)
                 VALUES (?1, 1, NULL, x'a0', 'in_progress')",
                [[9u8; 16]],
            )
            .map(|_| ())
        })
        .unwrap();
        b.close().unwrap();
    }

    // Reopen: recovery marks the straggler aborted, the import re-runs and
    // lands everything exactly once.
    let b = open(&dir, "b", ResolverStrategy::Manual);
    assert_eq!(b.device_id(), b_id);
    let aborted: i64 = b
        .with_connection(|conn| {
            conn.query_row(
                "SELECT count(*) FROM sync_checkpoints WHERE status = 'aborted'",
                [],
                |r| r.get(0),
            )
        })
        .unwrap();
    assert_eq!(aborted, 1);

    let result = b.import_bundle(&path).unwrap();
    assert_eq!(result.applied_count, 100);
    assert_eq!(table_dump(&b).len(), 100);

    // Second attempt: nothing more to do.
    let again = b.import_bundle(&path).unwrap();
    assert!(again.skipped);
    assert_eq!(table_dump(&b).len(), 100);
}

#[test]
fn additive_migration_replicates() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    let b = open(&dir, "b", ResolverStrategy::Manual);

    insert(&a, 1, "pre-migration");
    sync_pair(&dir, &a, &b);

    a.add_column("todos", "priority", "INTEGER", Some(meshsync_codec::Value::Integer(0)))
        .unwrap();
    a.with_connection(|conn| {
        conn.execute("INSERT INTO todos (id, title, priority) VALUES (2, 'urgent', 5)", [])
            .map(|_| ())
    })
    .unwrap();

    sync_pair(&dir, &a, &b);

    // B gained the column and the data op at schema version 2 applied.
    let priority: i64 = b
        .with_connection(|conn| {
            conn.query_row("SELECT priority FROM todos WHERE id = 2", [], |r| r.get(0))
        })
        .unwrap();
    assert_eq!(priority, 5);

    // B's own captures now carry the new version.
    b.with_connection(|conn| {
        conn.execute("INSERT INTO todos (id, title, priority) VALUES (3, 'b row', 1)", [])
            .map(|_| ())
    })
    .unwrap();
    let b_ops = b.get_new_operations(&a.get_vector_clock().unwrap()).unwrap();
    assert!(b_ops.iter().all(|op| op.schema_version == 2));
}

#[test]
fn delivery_order_does_not_change_the_outcome() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::LastWriteWins);

    for i in 0..4 {
        insert(&a, i, &format!("v1-{i}"));
    }
    for i in 0..4 {
        update_title(&a, i, &format!("v2-{i}"));
    }
    let ops = a.get_new_operations(&VectorClock::new()).unwrap();

    // Peer B gets the ops forwards in two batches; peer C gets them
    // backwards in odd-sized batches.
    let b = open(&dir, "b", ResolverStrategy::LastWriteWins);
    b.import_operations(ops[..3].to_vec()).unwrap();
    b.import_operations(ops[3..].to_vec()).unwrap();

    let c = open(&dir, "c", ResolverStrategy::LastWriteWins);
    let mut reversed = ops.clone();
    reversed.reverse();
    c.import_operations(reversed[..5].to_vec()).unwrap();
    c.import_operations(reversed[5..].to_vec()).unwrap();

    assert_eq!(table_dump(&b), table_dump(&c));
    assert_eq!(b.get_vector_clock().unwrap(), c.get_vector_clock().unwrap());
    assert_eq!(
        b.get_unresolved_conflicts().unwrap().len(),
        c.get_unresolved_conflicts().unwrap().len()
    );
}

#[test]
fn sync_loop_with_in_process_transport_converges() {
    let dir = TempDir::new().unwrap();
    let a = Arc::new(open(&dir, "a", ResolverStrategy::LastWriteWins));
    let b = Arc::new(open(&dir, "b", ResolverStrategy::LastWriteWins));

    insert(&a, 1, "from a");
    insert(&b, 2, "from b");

    let sync = SyncLoop::new(
        a.clone(),
        Box::new(InProcessTransport::new(b.clone())),
        SyncLoopConfig::default(),
    );
    let outcome = sync.sync_now().unwrap();
    assert_eq!(outcome.sent, 1);
    assert_eq!(outcome.received, 1);

    assert_eq!(table_dump(&a), table_dump(&b));
    assert_eq!(title_of(&a, 2).as_deref(), Some("from b"));
    assert_eq!(title_of(&b, 1).as_deref(), Some("from a"));
}

#[test]
fn compaction_prunes_acknowledged_ops() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    let b = open(&dir, "b", ResolverStrategy::Manual);

    for i in 0..5 {
        insert(&a, i, &format!("row {i}"));
    }
    sync_pair(&dir, &a, &b);

    // B's import recorded its clock back at A via the return bundle... but
    // an empty return generates nothing, so tell A explicitly what B holds.
    let b_clock = b.get_vector_clock().unwrap();
    let before = a.status().unwrap().operation_count;
    a.with_connection(|conn| {
        conn.execute(
            "UPDATE sync_peers SET last_received_vector_clock = ?1 WHERE peer_id = ?2",
            rusqlite::params![b_clock.encode().unwrap(), b.device_id().as_bytes()],
        )
        .map(|_| ())
    })
    .unwrap();

    let outcome = a.compact_log(1000).unwrap();
    assert!(outcome.pruned > 0);
    let after = a.status().unwrap().operation_count;
    assert!(after < before);
    // The chain head survives so future captures keep their parent link.
    assert!(after >= 1);
}

#[test]
fn unknown_peer_bundle_contains_everything() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", ResolverStrategy::Manual);
    insert(&a, 1, "x");

    let stranger = DeviceId::generate();
    let path = dir.path().join("stranger.bundle");
    assert!(a.generate_bundle(&stranger, &path).unwrap().is_some());

    // Caught-up peer gets nothing.
    let path2 = dir.path().join("nothing.bundle");
    assert!(a.generate_bundle(&stranger, &path2).unwrap().is_none());
}
