//! Node identity.

use meshsync_protocol::{DeviceId, Hlc};
use rusqlite::{Connection, OptionalExtension};

use crate::error::EngineResult;
use crate::functions::now_micros;

/// The identity of this node: created once, persisted, immutable after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// 128-bit opaque identifier.
    pub device_id: DeviceId,
    /// Human-readable name for status output.
    pub display_name: String,
    /// Creation wall time, Unix microseconds.
    pub created_at: i64,
}

/// Loads the persisted identity, creating one on first open.
///
/// `display_name` is only honoured at creation; an existing identity keeps
/// its name so initialisation stays idempotent.
pub(crate) fn load_or_create(
    conn: &Connection,
    display_name: Option<&str>,
) -> EngineResult<Device> {
    let existing = conn
        .query_row(
            "SELECT device_id, display_name, created_at FROM sync_device WHERE slot = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, [u8; 16]>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    if let Some((id, name, created_at)) = existing {
        return Ok(Device {
            device_id: DeviceId::from_bytes(id),
            display_name: name,
            created_at,
        });
    }

    let device = Device {
        device_id: DeviceId::generate(),
        display_name: display_name.unwrap_or("unnamed-device").to_string(),
        created_at: now_micros(),
    };
    conn.execute(
        "INSERT INTO sync_device (slot, device_id, display_name, created_at)
         VALUES (1, ?1, ?2, ?3)",
        rusqlite::params![
            device.device_id.as_bytes(),
            device.display_name,
            device.created_at
        ],
    )?;
    tracing::info!(device = %device.device_id, name = %device.display_name, "created device identity");
    Ok(device)
}

/// Reads the persisted HLC high-water mark.
pub(crate) fn load_last_hlc(conn: &Connection) -> EngineResult<Hlc> {
    let text: Option<String> = conn
        .query_row("SELECT last_hlc FROM sync_device WHERE slot = 1", [], |r| {
            r.get(0)
        })
        .optional()?;
    match text {
        Some(text) => Ok(Hlc::parse(&text)?),
        None => Ok(Hlc::ZERO),
    }
}

/// Persists the HLC high-water mark (on teardown).
pub(crate) fn store_last_hlc(conn: &Connection, hlc: Hlc) -> EngineResult<()> {
    conn.execute(
        "UPDATE sync_device SET last_hlc = ?1 WHERE slot = 1",
        [hlc.to_string()],
    )?;
    Ok(())
}
