//! Transport abstraction.
//!
//! The engine never talks to a network itself; a [`Transport`] adapter
//! moves operations and clocks on its behalf. HTTP, WebSocket and
//! file-drop adapters live outside this crate — this module holds the
//! contract, a scripted mock for unit tests, and an in-process adapter
//! that connects two engines directly.

use std::collections::VecDeque;
use std::sync::Arc;

use meshsync_protocol::{Operation, VectorClock};

use crate::engine::SyncEngine;
use crate::error::{EngineError, EngineResult};

/// A bidirectional session with one peer.
///
/// Contract (mirrored by the wire messages in `meshsync_protocol`):
/// - `connect`/`disconnect` bracket a session; `disconnect` is idempotent
/// - `exchange_vector_clock` is side-effect-free on user state
/// - `send_operations` is all-or-nothing per call and returns the count
///   the peer accepted
/// - `receive_operations` returns ops the peer believes we lack and never
///   includes ops at or below the clock we last reported
pub trait Transport: Send {
    /// Establishes a session.
    fn connect(&mut self) -> EngineResult<()>;

    /// Releases the session. Idempotent.
    fn disconnect(&mut self) -> EngineResult<()>;

    /// True while a session is established.
    fn is_connected(&self) -> bool;

    /// Presents our clock, returns the peer's.
    fn exchange_vector_clock(&mut self, local: &VectorClock) -> EngineResult<VectorClock>;

    /// Delivers operations to the peer; returns the accepted count.
    fn send_operations(&mut self, ops: &[Operation]) -> EngineResult<usize>;

    /// Fetches operations the peer thinks we lack.
    fn receive_operations(&mut self) -> EngineResult<Vec<Operation>>;
}

/// In-process adapter treating another engine as the remote side.
///
/// Useful for tests and same-host sync; the "peer" applies pushed ops
/// immediately through its own import pipeline.
pub struct InProcessTransport {
    remote: Arc<SyncEngine>,
    connected: bool,
    reported_clock: VectorClock,
}

impl InProcessTransport {
    /// Wraps a remote engine.
    #[must_use]
    pub fn new(remote: Arc<SyncEngine>) -> Self {
        Self {
            remote,
            connected: false,
            reported_clock: VectorClock::new(),
        }
    }
}

impl Transport for InProcessTransport {
    fn connect(&mut self) -> EngineResult<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> EngineResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn exchange_vector_clock(&mut self, local: &VectorClock) -> EngineResult<VectorClock> {
        if !self.connected {
            return Err(EngineError::transport_retryable("not connected"));
        }
        self.reported_clock = local.clone();
        self.remote.get_vector_clock()
    }

    fn send_operations(&mut self, ops: &[Operation]) -> EngineResult<usize> {
        if !self.connected {
            return Err(EngineError::transport_retryable("not connected"));
        }
        self.remote.import_operations(ops.to_vec())?;
        Ok(ops.len())
    }

    fn receive_operations(&mut self) -> EngineResult<Vec<Operation>> {
        if !self.connected {
            return Err(EngineError::transport_retryable("not connected"));
        }
        self.remote.get_new_operations(&self.reported_clock)
    }
}

/// Scripted transport for unit tests.
#[derive(Default)]
pub struct MockTransport {
    connected: bool,
    /// Clock handed back by `exchange_vector_clock`.
    pub peer_clock: VectorClock,
    /// Batches returned by successive `receive_operations` calls.
    pub incoming: VecDeque<Vec<Operation>>,
    /// Everything passed to `send_operations`.
    pub sent: Vec<Operation>,
    /// When set, every call fails with a retryable transport error.
    pub failing: bool,
}

impl MockTransport {
    /// Creates an idle mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> EngineResult<()> {
        if self.failing {
            return Err(EngineError::transport_retryable("mock failure"));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> EngineResult<()> {
        self.check()?;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> EngineResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn exchange_vector_clock(&mut self, _local: &VectorClock) -> EngineResult<VectorClock> {
        self.check()?;
        Ok(self.peer_clock.clone())
    }

    fn send_operations(&mut self, ops: &[Operation]) -> EngineResult<usize> {
        self.check()?;
        self.sent.extend_from_slice(ops);
        Ok(ops.len())
    }

    fn receive_operations(&mut self) -> EngineResult<Vec<Operation>> {
        self.check()?;
        Ok(self.incoming.pop_front().unwrap_or_default())
    }
}
