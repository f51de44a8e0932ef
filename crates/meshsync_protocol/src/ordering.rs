//! Deterministic total ordering over operation sets.
//!
//! Any two devices handed the same set of operations must replay them in
//! the same sequence, or their user tables diverge. The order used
//! everywhere is the scalar key `(hlc, device_id, op_id)`:
//!
//! - if `a` causally precedes `b` (vector clocks ordered), `a`'s HLC is
//!   smaller, because the device that captured `b` had observed `a`'s HLC
//!   first — so the key extends the causal partial order;
//! - concurrent operations fall back to physical timestamp, then
//!   originator, then op id, which is total because op ids are unique.

use std::cmp::Ordering;

use crate::clock::{CausalOrder, VectorClock};
use crate::operation::Operation;

/// Compares two operations under the global deterministic order.
#[must_use]
pub fn cmp_operations(a: &Operation, b: &Operation) -> Ordering {
    (a.hlc, a.device_id.as_bytes(), a.op_id.as_bytes()).cmp(&(
        b.hlc,
        b.device_id.as_bytes(),
        b.op_id.as_bytes(),
    ))
}

/// Sorts a batch into the global deterministic order.
pub fn sort_deterministic(ops: &mut [Operation]) {
    ops.sort_by(cmp_operations);
}

/// Compares the causal relationship of two operations' clocks.
#[must_use]
pub fn compare_causal(a: &Operation, b: &Operation) -> CausalOrder {
    a.vector_clock.compare(&b.vector_clock)
}

/// Clock half of the dedup filter.
///
/// If the local clock already counts at least as far as the op's own
/// counter for its originating device, the op (or a successor from that
/// device) has already been folded in.
#[must_use]
pub fn is_dominated_by_clock(op: &Operation, local: &VectorClock) -> bool {
    local.counter_for(&op.device_id) >= op.device_counter()
}
