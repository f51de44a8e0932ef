//! Peer bookkeeping.
//!
//! For every peer the engine remembers the clocks last exchanged in each
//! direction. `last_sent` bounds what the next bundle must contain;
//! `last_received` is the peer's own clock as of its last delivery and is
//! what compaction reasons about.

use meshsync_protocol::{DeviceId, VectorClock};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::EngineResult;
use crate::functions::now_micros;

/// A known peer and the sync state kept for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Peer device id.
    pub peer_id: DeviceId,
    /// Free-form address hint for transports (URL, path).
    pub endpoint_hint: Option<String>,
    /// Last time any traffic touched this peer, Unix microseconds.
    pub last_seen: Option<i64>,
    /// Last completed sync, Unix microseconds.
    pub last_sync_at: Option<i64>,
    /// Our clock when we last generated for the peer.
    pub last_sent_vector_clock: VectorClock,
    /// The peer's clock as of its last delivery to us.
    pub last_received_vector_clock: VectorClock,
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    let id: [u8; 16] = row.get(0)?;
    let sent: Vec<u8> = row.get(4)?;
    let received: Vec<u8> = row.get(5)?;
    let decode = |idx: usize, blob: &[u8]| {
        VectorClock::decode(blob).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Blob,
                Box::new(e),
            )
        })
    };
    Ok(Peer {
        peer_id: DeviceId::from_bytes(id),
        endpoint_hint: row.get(1)?,
        last_seen: row.get(2)?,
        last_sync_at: row.get(3)?,
        last_sent_vector_clock: decode(4, &sent)?,
        last_received_vector_clock: decode(5, &received)?,
    })
}

const COLUMNS: &str = "peer_id, endpoint_hint, last_seen, last_sync_at, \
     last_sent_vector_clock, last_received_vector_clock";

fn ensure_row(conn: &Connection, peer_id: &DeviceId) -> EngineResult<()> {
    let empty = VectorClock::new().encode()?;
    conn.execute(
        "INSERT OR IGNORE INTO sync_peers
            (peer_id, last_sent_vector_clock, last_received_vector_clock)
         VALUES (?1, ?2, ?2)",
        rusqlite::params![peer_id.as_bytes(), empty],
    )?;
    Ok(())
}

/// Fetches one peer.
pub(crate) fn get(conn: &Connection, peer_id: &DeviceId) -> EngineResult<Option<Peer>> {
    let peer = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM sync_peers WHERE peer_id = ?1"),
            [peer_id.as_bytes()],
            peer_from_row,
        )
        .optional()?;
    Ok(peer)
}

/// All known peers.
pub(crate) fn all(conn: &Connection) -> EngineResult<Vec<Peer>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sync_peers"))?;
    let peers = stmt
        .query_map([], peer_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(peers)
}

/// Registers a peer (optionally with an endpoint hint).
pub(crate) fn register(
    conn: &Connection,
    peer_id: &DeviceId,
    endpoint_hint: Option<&str>,
) -> EngineResult<()> {
    ensure_row(conn, peer_id)?;
    if let Some(hint) = endpoint_hint {
        conn.execute(
            "UPDATE sync_peers SET endpoint_hint = ?1 WHERE peer_id = ?2",
            rusqlite::params![hint, peer_id.as_bytes()],
        )?;
    }
    Ok(())
}

/// Records that we generated a delta for the peer at the given clock.
pub(crate) fn record_sent(
    conn: &Connection,
    peer_id: &DeviceId,
    clock: &VectorClock,
) -> EngineResult<()> {
    ensure_row(conn, peer_id)?;
    conn.execute(
        "UPDATE sync_peers
         SET last_sent_vector_clock = ?1, last_seen = ?2
         WHERE peer_id = ?3",
        rusqlite::params![clock.encode()?, now_micros(), peer_id.as_bytes()],
    )?;
    Ok(())
}

/// Records the peer's clock after a delivery from it; keeps the max of old
/// and new so replays can never regress it.
pub(crate) fn record_received(
    conn: &Connection,
    peer_id: &DeviceId,
    clock: &VectorClock,
) -> EngineResult<()> {
    ensure_row(conn, peer_id)?;
    let mut merged = get(conn, peer_id)?
        .map(|peer| peer.last_received_vector_clock)
        .unwrap_or_default();
    merged.merge(clock);
    let now = now_micros();
    conn.execute(
        "UPDATE sync_peers
         SET last_received_vector_clock = ?1, last_seen = ?2, last_sync_at = ?2
         WHERE peer_id = ?3",
        rusqlite::params![merged.encode()?, now, peer_id.as_bytes()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{functions, schema};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        functions::register_for_tests(&conn);
        schema::initialize(&conn).unwrap();
        conn
    }

    fn device(tag: u8) -> DeviceId {
        DeviceId::from_bytes([tag; 16])
    }

    #[test]
    fn unknown_peer_is_none() {
        let conn = setup();
        assert!(get(&conn, &device(1)).unwrap().is_none());
        assert!(all(&conn).unwrap().is_empty());
    }

    #[test]
    fn register_and_update_clocks() {
        let conn = setup();
        let peer = device(1);
        register(&conn, &peer, Some("http://peer:8080")).unwrap();

        let sent: VectorClock = [(device(9), 4)].into_iter().collect();
        record_sent(&conn, &peer, &sent).unwrap();

        let loaded = get(&conn, &peer).unwrap().unwrap();
        assert_eq!(loaded.endpoint_hint.as_deref(), Some("http://peer:8080"));
        assert_eq!(loaded.last_sent_vector_clock, sent);
        assert!(loaded.last_seen.is_some());
        assert!(loaded.last_sync_at.is_none());
    }

    #[test]
    fn received_clock_never_regresses() {
        let conn = setup();
        let peer = device(1);
        record_received(&conn, &peer, &[(device(9), 5)].into_iter().collect()).unwrap();
        record_received(&conn, &peer, &[(device(9), 3)].into_iter().collect()).unwrap();

        let loaded = get(&conn, &peer).unwrap().unwrap();
        assert_eq!(loaded.last_received_vector_clock.counter_for(&device(9)), 5);
        assert!(loaded.last_sync_at.is_some());
    }
}
