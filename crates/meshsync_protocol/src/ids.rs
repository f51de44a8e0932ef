//! 128-bit identifiers.
//!
//! All identities in the mesh are 16-byte values. Device ids are random;
//! operation, bundle and conflict ids follow the UUIDv7 layout — 48 bits of
//! big-endian Unix milliseconds followed by random bits — so they sort by
//! creation time while staying globally unique.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Builds a UUIDv7-layout id from a millisecond timestamp and random tail.
fn v7_bytes(unix_ms: u64, mut tail: [u8; 10]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&unix_ms.to_be_bytes()[2..]);
    tail[0] = (tail[0] & 0x0f) | 0x70; // version 7
    tail[2] = (tail[2] & 0x3f) | 0x80; // RFC 4122 variant
    bytes[6..].copy_from_slice(&tail);
    bytes
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Wraps raw bytes.
            #[inline]
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes.
            #[inline]
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// Wraps a slice, or `None` if it is not exactly 16 bytes.
            #[must_use]
            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                <[u8; 16]>::try_from(slice).ok().map(Self)
            }

            /// Parses the canonical hyphenated UUID form.
            pub fn parse(text: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(text).map(|u| Self(u.into_bytes()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", Uuid::from_bytes(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), Uuid::from_bytes(self.0))
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; 16] {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type! {
    /// A node identity. Random, created once at initialisation, immutable.
    DeviceId
}

id_type! {
    /// A time-ordered operation id (k-sortable across devices).
    OpId
}

id_type! {
    /// A time-ordered bundle id.
    BundleId
}

id_type! {
    /// A time-ordered conflict-record id.
    ConflictId
}

impl DeviceId {
    /// Generates a fresh random device identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }
}

macro_rules! time_ordered {
    ($name:ident) => {
        impl $name {
            /// Generates a new id at the current wall time.
            #[must_use]
            pub fn generate() -> Self {
                Self::generate_at(unix_millis())
            }

            /// Generates an id for a specific millisecond timestamp.
            #[must_use]
            pub fn generate_at(unix_ms: u64) -> Self {
                Self(v7_bytes(unix_ms, rand::random()))
            }
        }
    };
}

time_ordered!(OpId);
time_ordered!(BundleId);
time_ordered!(ConflictId);
