//! `meshsync enable`

use std::path::Path;

use meshsync_engine::EngineResult;

use super::open_engine;

pub fn run(db: &Path, table: &str) -> EngineResult<()> {
    let engine = open_engine(db, None)?;
    engine.enable_sync_for_table(table)?;
    println!("sync enabled for '{table}'");
    engine.close()
}
