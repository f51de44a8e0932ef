//! `meshsync conflicts`

use std::path::Path;

use meshsync_engine::EngineResult;

use super::open_engine;

pub fn run(db: &Path) -> EngineResult<()> {
    let engine = open_engine(db, None)?;
    let conflicts = engine.get_unresolved_conflicts()?;

    if conflicts.is_empty() {
        println!("no unresolved conflicts");
    } else {
        for record in &conflicts {
            println!(
                "{}  table={} state={} local={} remote={}",
                record.conflict_id,
                record.table_name,
                record.resolution_state.as_str(),
                record.local_op_id,
                record.remote_op_id
            );
        }
        println!("{} conflicts", conflicts.len());
    }
    engine.close()
}
