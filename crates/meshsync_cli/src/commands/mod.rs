//! Command implementations.

pub mod conflicts;
pub mod enable;
pub mod init;
pub mod migrate;
pub mod peers;
pub mod resolve;
pub mod snapshot;
pub mod status;
pub mod sync;

use std::path::Path;

use meshsync_engine::{EngineConfig, EngineError, EngineResult, SyncEngine};
use meshsync_protocol::DeviceId;

/// Opens the engine at `db`.
pub(crate) fn open_engine(db: &Path, device_name: Option<&str>) -> EngineResult<SyncEngine> {
    let mut config = EngineConfig::new(db);
    if let Some(name) = device_name {
        config = config.with_device_name(name);
    }
    SyncEngine::open(config)
}

/// Parses a device id argument.
pub(crate) fn parse_device_id(text: &str) -> EngineResult<DeviceId> {
    DeviceId::parse(text)
        .map_err(|_| EngineError::validation(format!("'{text}' is not a device id")))
}
