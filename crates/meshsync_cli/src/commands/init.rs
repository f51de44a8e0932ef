//! `meshsync init`

use std::path::Path;

use meshsync_engine::EngineResult;

use super::open_engine;

pub fn run(db: &Path, name: Option<&str>) -> EngineResult<()> {
    let engine = open_engine(db, name)?;
    println!("initialised {}", db.display());
    println!("device id:   {}", engine.device_id());
    println!("device name: {}", engine.device_name());
    engine.close()
}
