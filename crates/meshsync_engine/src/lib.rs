//! # meshsync engine
//!
//! Turns a SQLite database into a node of an eventually-consistent,
//! multi-master replication mesh:
//!
//! - AFTER triggers on opted-in tables capture every row mutation as an
//!   immutable operation in an append-only log, inside the user's own
//!   transaction
//! - vector clocks track causality; a hybrid logical clock provides the
//!   deterministic total order and last-write-wins tie-break
//! - peers exchange operations as self-contained bundle files or streamed
//!   batches; import is idempotent, checkpointed and crash-safe
//! - concurrent writes to the same row become explicit conflict records
//!   with pluggable resolution, never silent overwrites
//! - additive schema migrations replicate as operations
//!
//! ## Usage
//!
//! ```no_run
//! use meshsync_engine::{EngineConfig, SyncEngine};
//!
//! let engine = SyncEngine::open(EngineConfig::new("app.db"))?;
//! engine.with_connection(|conn| {
//!     conn.execute_batch("CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT)")
//! })?;
//! engine.enable_sync_for_table("todos")?;
//!
//! // Writes through the engine's connection replicate.
//! engine.with_connection(|conn| {
//!     conn.execute("INSERT INTO todos (id, title) VALUES (1, 'hello')", [])
//! })?;
//!
//! // Ship everything a peer lacks.
//! let peer = meshsync_protocol::DeviceId::generate();
//! engine.generate_bundle(&peer, std::path::Path::new("out.bundle"))?;
//! # Ok::<(), meshsync_engine::EngineError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod bundle;
mod capture;
mod checkpoint;
mod compact;
mod config;
mod conflicts;
mod device;
mod engine;
mod error;
mod functions;
mod log;
mod migrate;
mod peers;
mod resolve;
mod schema;
mod sync_loop;
mod transport;

pub use apply::BatchOutcome;
pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use compact::CompactionOutcome;
pub use config::{EngineConfig, SyncLoopConfig};
pub use device::Device;
pub use engine::{EngineStatus, ImportResult, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use migrate::Migration;
pub use peers::Peer;
pub use resolve::{ConflictContext, Resolution, ResolverStrategy};
pub use sync_loop::{CycleOutcome, SyncLoop, SyncStats, SyncStatus};
pub use transport::{InProcessTransport, MockTransport, Transport};
