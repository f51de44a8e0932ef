//! `meshsync status`

use std::path::Path;

use meshsync_engine::EngineResult;

use super::open_engine;

pub fn run(db: &Path) -> EngineResult<()> {
    let engine = open_engine(db, None)?;
    let status = engine.status()?;

    println!("device:      {} ({})", status.device_id, status.device_name);
    println!("clock:       {}", status.vector_clock);
    println!("operations:  {}", status.operation_count);
    println!("peers:       {}", status.peer_count);
    println!("conflicts:   {} unresolved", status.unresolved_conflicts);
    if status.enabled_tables.is_empty() {
        println!("tables:      (none enabled)");
    } else {
        println!("tables:      {}", status.enabled_tables.join(", "));
    }
    engine.close()
}
