//! `meshsync resolve`

use std::path::Path;

use meshsync_engine::{EngineError, EngineResult, ResolverStrategy};
use meshsync_protocol::ConflictId;

use super::open_engine;

pub fn run(db: &Path, conflict: &str, strategy: &str, prefer_local: bool) -> EngineResult<()> {
    let conflict_id = ConflictId::parse(conflict)
        .map_err(|_| EngineError::validation(format!("'{conflict}' is not a conflict id")))?;

    let strategy = match strategy {
        "lww" => ResolverStrategy::LastWriteWins,
        "merge" => ResolverStrategy::FieldMerge { prefer_local },
        "manual" => ResolverStrategy::Manual,
        other => {
            return Err(EngineError::validation(format!(
                "unknown strategy '{other}' (expected lww, merge or manual)"
            )))
        }
    };

    let engine = open_engine(db, None)?;
    engine.resolve_conflict(&conflict_id, &strategy)?;
    println!("conflict {conflict_id} resolved via {}", strategy.name());
    engine.close()
}
