//! `meshsync peers`

use std::path::Path;

use meshsync_engine::EngineResult;

use super::open_engine;

pub fn run(db: &Path) -> EngineResult<()> {
    let engine = open_engine(db, None)?;
    let peers = engine.get_peers()?;

    if peers.is_empty() {
        println!("no known peers");
    } else {
        for peer in &peers {
            let endpoint = peer.endpoint_hint.as_deref().unwrap_or("-");
            println!(
                "{}  endpoint={} sent={} received={}",
                peer.peer_id, endpoint, peer.last_sent_vector_clock, peer.last_received_vector_clock
            );
        }
    }
    engine.close()
}
