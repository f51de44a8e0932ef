//! Conflict records.

use crate::ids::{ConflictId, OpId};

/// Lifecycle state of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Detected, no decision yet.
    Unresolved,
    /// A winner was chosen; terminal.
    Resolved,
    /// A resolver explicitly punted to an operator.
    Deferred,
}

impl ResolutionState {
    /// Stable text code for the SQL layer.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::Resolved => "resolved",
            ResolutionState::Deferred => "deferred",
        }
    }

    /// Parses the text code.
    #[must_use]
    pub fn from_str(code: &str) -> Option<Self> {
        match code {
            "unresolved" => Some(ResolutionState::Unresolved),
            "resolved" => Some(ResolutionState::Resolved),
            "deferred" => Some(ResolutionState::Deferred),
            _ => None,
        }
    }
}

/// A detected pair of concurrent mutating operations on one row.
///
/// Conflicts reference operations by id only; the ops themselves stay in
/// the log. A conflict is created the moment import sees concurrency and is
/// closed either by a resolver choice or by a later operation that causally
/// supersedes both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// Unique, time-ordered id.
    pub conflict_id: ConflictId,
    /// Table the row lives in.
    pub table_name: String,
    /// Canonical primary-key blob of the contested row.
    pub row_pk: Vec<u8>,
    /// The op that had written the row locally.
    pub local_op_id: OpId,
    /// The concurrent incoming op.
    pub remote_op_id: OpId,
    /// Detection wall time, Unix microseconds.
    pub detected_at: i64,
    /// Current lifecycle state.
    pub resolution_state: ResolutionState,
    /// Name of the strategy that resolved it, if any.
    pub resolved_by: Option<String>,
    /// The op whose values won, once resolved.
    pub winning_op_id: Option<OpId>,
}

impl ConflictRecord {
    /// Creates a fresh unresolved record.
    #[must_use]
    pub fn detected(
        table_name: impl Into<String>,
        row_pk: Vec<u8>,
        local_op_id: OpId,
        remote_op_id: OpId,
        detected_at: i64,
    ) -> Self {
        Self {
            conflict_id: ConflictId::generate(),
            table_name: table_name.into(),
            row_pk,
            local_op_id,
            remote_op_id,
            detected_at,
            resolution_state: ResolutionState::Unresolved,
            resolved_by: None,
            winning_op_id: None,
        }
    }

    /// True while no terminal decision has been made.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self.resolution_state, ResolutionState::Resolved)
    }
}
