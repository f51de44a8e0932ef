//! # meshsync protocol
//!
//! Pure protocol types for the meshsync replication mesh:
//!
//! - time-ordered 128-bit identifiers ([`OpId`], [`DeviceId`], [`BundleId`])
//! - the causality layer: [`VectorClock`] and the hybrid logical clock
//!   ([`Hlc`], [`HlcClock`])
//! - the replication unit itself ([`Operation`]) and [`ConflictRecord`]
//! - deterministic total ordering over operation sets
//! - bundle manifests with content hashing
//! - transport request/response messages
//!
//! Everything here is I/O-free; persistence and transports live in
//! `meshsync_engine` and external adapters.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bundle;
mod clock;
mod conflict;
mod ids;
mod messages;
mod operation;
mod ordering;

pub use bundle::{BundleManifest, SchemaSnapshot, BUNDLE_FORMAT_VERSION};
pub use clock::{CausalOrder, Hlc, HlcClock, VectorClock};
pub use conflict::{ConflictRecord, ResolutionState};
pub use ids::{BundleId, ConflictId, DeviceId, OpId};
pub use messages::{
    HelloRequest, HelloResponse, OpsRequest, OpsResponse, PushAck, PushOps, SyncMessage,
};
pub use operation::{OpType, Operation};
pub use ordering::{cmp_operations, compare_causal, is_dominated_by_clock, sort_deterministic};
