//! `meshsync sync`
//!
//! File-drop synchronisation: import a bundle received from the peer, then
//! export a bundle of what the peer still lacks. Network transports are
//! external services speaking the same bundle and message formats.

use std::path::Path;

use meshsync_engine::EngineResult;

use super::{open_engine, parse_device_id};

pub fn run(
    db: &Path,
    peer: &str,
    pull: Option<&Path>,
    push: Option<&Path>,
) -> EngineResult<()> {
    let peer_id = parse_device_id(peer)?;
    let engine = open_engine(db, None)?;
    engine.register_peer(&peer_id, None)?;

    if let Some(bundle) = pull {
        let result = engine.import_bundle(bundle)?;
        if result.skipped {
            println!("pull: {} already imported", result.bundle_id);
        } else {
            println!(
                "pull: {} ops, {} applied, {} conflicts, {} duplicates",
                result.total_operations,
                result.applied_count,
                result.conflict_count,
                result.duplicate_count
            );
        }
    }

    if let Some(out) = push {
        match engine.generate_bundle(&peer_id, out)? {
            Some(path) => println!("push: bundle written to {}", path.display()),
            None => println!("push: peer is up to date"),
        }
    }

    let open_conflicts = engine.get_unresolved_conflicts()?.len();
    if open_conflicts > 0 {
        println!("note: {open_conflicts} conflicts await resolution");
    }
    engine.close()
}
