//! Vector clocks and the hybrid logical clock.
//!
//! Vector clocks are authoritative for causality: they decide whether two
//! operations are ordered or concurrent, and concurrency on the same row is
//! the definition of a conflict. The HLC rides on top as the total-order
//! tie-break — it correlates with wall time and, because every import
//! observes the remote HLC before the next local tick, HLC order always
//! extends causal order.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use meshsync_codec::{decode_value, encode_value, CodecError, CodecResult, Value};

use crate::ids::DeviceId;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// The clocks are identical.
    Equal,
    /// The left clock happened before the right.
    Before,
    /// The left clock happened after the right.
    After,
    /// Neither clock dominates: the events were concurrent.
    Concurrent,
}

/// A per-device counter map expressing causal history.
///
/// Missing devices count as zero. The local device's counter increments
/// exactly once per captured operation; merging takes the element-wise max.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no device has a counter yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns the counter for a device (zero when absent).
    #[must_use]
    pub fn counter_for(&self, device: &DeviceId) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// Bumps a device's counter by one and returns the new value.
    pub fn increment(&mut self, device: DeviceId) -> u64 {
        let counter = self.counters.entry(device).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Sets a device's counter, keeping the maximum of old and new.
    /// Zero counters are never materialised (absent means zero).
    pub fn observe(&mut self, device: DeviceId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.counters.entry(device).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Merges another clock into this one (element-wise max).
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, counter) in &other.counters {
            self.observe(*device, *counter);
        }
    }

    /// Returns true if this clock has seen everything `other` has.
    #[must_use]
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .counters
            .iter()
            .all(|(device, counter)| self.counter_for(device) >= *counter)
    }

    /// Compares two clocks under the happened-before partial order.
    #[must_use]
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Iterates over `(device, counter)` entries in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.counters.iter()
    }

    /// Number of devices with a non-zero counter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Encodes to a canonical CBOR map of device bytes → counter.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode_value(&self.to_value())
    }

    /// Decodes from the canonical CBOR form.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&decode_value(bytes)?)
    }

    /// Converts to the CBOR value used inside larger records.
    pub(crate) fn to_value(&self) -> Value {
        Value::map(
            self.counters
                .iter()
                .map(|(device, counter)| {
                    (
                        Value::Bytes(device.as_bytes().to_vec()),
                        Value::Integer(*counter as i64),
                    )
                })
                .collect(),
        )
    }

    /// Reads the CBOR value form back into a clock.
    pub(crate) fn from_value(value: &Value) -> CodecResult<Self> {
        let pairs = value
            .as_map()
            .ok_or_else(|| CodecError::shape("vector clock is not a map"))?;

        let mut counters = BTreeMap::new();
        for (key, counter) in pairs {
            let device = key
                .as_bytes()
                .and_then(DeviceId::from_slice)
                .ok_or_else(|| CodecError::shape("vector clock key is not a device id"))?;
            let counter = counter
                .as_integer()
                .filter(|n| *n >= 0)
                .ok_or_else(|| CodecError::shape("vector clock counter is not a counter"))?;
            counters.insert(device, counter as u64);
        }
        Ok(Self { counters })
    }
}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (DeviceId, u64)>>(iter: T) -> Self {
        Self {
            counters: iter.into_iter().filter(|(_, c)| *c > 0).collect(),
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (device, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        write!(f, "}}")
    }
}

/// One point of the hybrid logical clock.
///
/// Ordered by wall time, then the logical counter. The text form
/// `"wall_ms:logical"` is what the operation log stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    /// Physical component, Unix milliseconds.
    pub wall_ms: u64,
    /// Logical tie-break within one millisecond.
    pub logical: u32,
}

impl Hlc {
    /// The zero point.
    pub const ZERO: Hlc = Hlc {
        wall_ms: 0,
        logical: 0,
    };

    /// Creates a point from its components.
    #[must_use]
    pub const fn new(wall_ms: u64, logical: u32) -> Self {
        Self { wall_ms, logical }
    }

    /// Parses the `"wall_ms:logical"` text form.
    pub fn parse(text: &str) -> CodecResult<Self> {
        let (wall, logical) = text
            .split_once(':')
            .ok_or_else(|| CodecError::invalid("hlc text missing separator"))?;
        let wall_ms = wall
            .parse()
            .map_err(|_| CodecError::invalid("hlc wall time is not a number"))?;
        let logical = logical
            .parse()
            .map_err(|_| CodecError::invalid("hlc logical counter is not a number"))?;
        Ok(Self { wall_ms, logical })
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.wall_ms, self.logical)
    }
}

/// Generator state for hybrid logical clock points.
///
/// One per engine; callers serialise access. `tick` stamps local events,
/// `observe` folds in a remote point so later local ticks sort after it.
#[derive(Debug, Clone)]
pub struct HlcClock {
    last: Hlc,
}

impl HlcClock {
    /// Creates a clock that has seen nothing.
    #[must_use]
    pub fn new() -> Self {
        Self { last: Hlc::ZERO }
    }

    /// Restores a clock from its last persisted point.
    #[must_use]
    pub fn resume(last: Hlc) -> Self {
        Self { last }
    }

    /// The most recent point handed out or observed.
    #[must_use]
    pub fn last(&self) -> Hlc {
        self.last
    }

    /// Stamps a local event at the current wall time.
    pub fn tick(&mut self) -> Hlc {
        self.tick_at(wall_now_ms())
    }

    /// Stamps a local event at an explicit wall time.
    pub fn tick_at(&mut self, now_ms: u64) -> Hlc {
        self.last = if now_ms > self.last.wall_ms {
            Hlc::new(now_ms, 0)
        } else {
            Hlc::new(self.last.wall_ms, self.last.logical + 1)
        };
        self.last
    }

    /// Folds in a remote point at the current wall time.
    pub fn observe(&mut self, remote: Hlc) -> Hlc {
        self.observe_at(wall_now_ms(), remote)
    }

    /// Folds in a remote point at an explicit wall time.
    pub fn observe_at(&mut self, now_ms: u64, remote: Hlc) -> Hlc {
        let wall = now_ms.max(self.last.wall_ms).max(remote.wall_ms);
        let logical = if wall == self.last.wall_ms && wall == remote.wall_ms {
            self.last.logical.max(remote.logical) + 1
        } else if wall == self.last.wall_ms {
            self.last.logical + 1
        } else if wall == remote.wall_ms {
            remote.logical + 1
        } else {
            0
        };
        self.last = Hlc::new(wall, logical);
        self.last
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
