//! `meshsync snapshot`

use std::path::Path;

use meshsync_engine::EngineResult;
use meshsync_protocol::DeviceId;

use super::{open_engine, parse_device_id};

pub fn run(db: &Path, out: &Path, peer: Option<&str>) -> EngineResult<()> {
    // A bundle for a peer nobody has heard of contains the full log.
    let peer_id = match peer {
        Some(text) => parse_device_id(text)?,
        None => DeviceId::from_bytes([0; 16]),
    };

    let engine = open_engine(db, None)?;
    match engine.generate_bundle(&peer_id, out)? {
        Some(path) => println!("snapshot written to {}", path.display()),
        None => println!("nothing to export"),
    }
    engine.close()
}
