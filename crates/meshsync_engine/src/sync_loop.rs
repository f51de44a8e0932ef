//! The background sync loop.
//!
//! A state machine over {idle, syncing, waiting_retry, error, stopped}
//! driving one transport at an interval. Retry timing is data
//! ([`SyncLoopConfig::delay_for_attempt`]), cancellation is a flag checked
//! between state transitions, and a single-flight lock keeps cycles from
//! overlapping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshsync_protocol::Operation;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::apply::BatchOutcome;
use crate::config::SyncLoopConfig;
use crate::engine::SyncEngine;
use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Waiting for the next tick.
    Idle,
    /// A cycle is in flight.
    Syncing,
    /// A transient failure; a backoff delay is pending.
    WaitingRetry,
    /// A permanent failure (schema, bundle, auth); the loop parked.
    Error,
    /// `stop()` was honoured.
    Stopped,
}

/// Counters the loop accumulates.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed cycles (successful).
    pub cycles: u64,
    /// Cycles that failed.
    pub failures: u64,
    /// Operations pushed to the peer.
    pub ops_sent: u64,
    /// Operations received and fed to the import pipeline.
    pub ops_received: u64,
    /// Conflicts recorded while applying received ops.
    pub conflicts: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// What one successful cycle did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    /// Ops pushed.
    pub sent: usize,
    /// Ops received.
    pub received: usize,
    /// Outcome of applying the received batch.
    pub batch: BatchOutcome,
}

/// Drives one engine against one peer transport.
pub struct SyncLoop {
    engine: Arc<SyncEngine>,
    transport: Mutex<Box<dyn Transport>>,
    config: SyncLoopConfig,
    status: RwLock<SyncStatus>,
    stats: RwLock<SyncStats>,
    stop: AtomicBool,
    in_flight: AtomicBool,
    attempt: AtomicU32,
}

impl SyncLoop {
    /// Creates a stopped loop.
    pub fn new(
        engine: Arc<SyncEngine>,
        transport: Box<dyn Transport>,
        config: SyncLoopConfig,
    ) -> Self {
        Self {
            engine,
            transport: Mutex::new(transport),
            config,
            status: RwLock::new(SyncStatus::Idle),
            stats: RwLock::new(SyncStats::default()),
            stop: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
        }
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        *self.status.read()
    }

    /// Accumulated counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Requests a cooperative stop; honoured between state transitions.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.write() = status;
    }

    /// Runs one sync cycle now, regardless of the interval.
    ///
    /// Fails with [`EngineError::InvalidState`] if a cycle is already in
    /// flight (single-flight).
    pub fn sync_now(&self) -> EngineResult<CycleOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState("sync already in progress".into()));
        }
        self.set_status(SyncStatus::Syncing);
        let result = self.cycle();
        self.in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(outcome) => {
                self.set_status(SyncStatus::Idle);
                self.attempt.store(0, Ordering::SeqCst);
                let mut stats = self.stats.write();
                stats.cycles += 1;
                stats.ops_sent += outcome.sent as u64;
                stats.ops_received += outcome.received as u64;
                stats.conflicts += outcome.batch.conflicts as u64;
                stats.last_error = None;
            }
            Err(e) => {
                let mut stats = self.stats.write();
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
                drop(stats);
                self.set_status(if e.is_retryable() {
                    SyncStatus::WaitingRetry
                } else {
                    SyncStatus::Error
                });
            }
        }
        result
    }

    /// One full exchange: clocks, push, pull, apply.
    fn cycle(&self) -> EngineResult<CycleOutcome> {
        let mut transport = self.transport.lock();
        if !transport.is_connected() {
            transport.connect()?;
        }

        let local_clock = self.engine.get_vector_clock()?;
        let peer_clock = transport.exchange_vector_clock(&local_clock)?;
        debug!(%local_clock, %peer_clock, "clocks exchanged");

        let to_send = self.engine.get_new_operations(&peer_clock)?;
        let sent = if to_send.is_empty() {
            0
        } else {
            transport.send_operations(&to_send)?
        };

        let received: Vec<Operation> = transport.receive_operations()?;
        let received_count = received.len();
        let batch = if received.is_empty() {
            BatchOutcome::default()
        } else {
            self.engine.import_operations(received)?
        };

        debug!(sent, received = received_count, "cycle complete");
        Ok(CycleOutcome {
            sent,
            received: received_count,
            batch,
        })
    }

    /// Blocking loop: cycle, sleep, repeat, with exponential backoff on
    /// transient errors, until `stop()` or a permanent error.
    pub fn run(&self) {
        info!(interval = ?self.config.interval, "sync loop started");
        while !self.stop.load(Ordering::SeqCst) {
            match self.sync_now() {
                Ok(_) => {
                    if self.sleep_interruptible(self.config.interval) {
                        break;
                    }
                }
                Err(e) if e.is_retryable() => {
                    let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > self.config.max_retries {
                        warn!(error = %e, attempt, "retries exhausted");
                        self.set_status(SyncStatus::Error);
                        break;
                    }
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, ?delay, "transient sync failure, backing off");
                    if self.sleep_interruptible(delay) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "permanent sync failure, loop parked");
                    break;
                }
            }
        }
        if self.stop.load(Ordering::SeqCst) {
            self.set_status(SyncStatus::Stopped);
        }
        let _ = self.transport.lock().disconnect();
        info!("sync loop exited");
    }

    /// Sleeps in small slices, returning true if a stop arrived.
    fn sleep_interruptible(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.stop.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25).min(total));
        }
        self.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transport::MockTransport;

    fn engine() -> Arc<SyncEngine> {
        let engine = SyncEngine::open(EngineConfig::new(":memory:")).unwrap();
        engine
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)")
            })
            .unwrap();
        engine.enable_sync_for_table("todos").unwrap();
        Arc::new(engine)
    }

    #[test]
    fn successful_cycle_returns_to_idle() {
        let engine = engine();
        engine
            .with_connection(|conn| {
                conn.execute("INSERT INTO todos VALUES (1, 'hi')", []).map(|_| ())
            })
            .unwrap();

        let sync = SyncLoop::new(
            engine,
            Box::new(MockTransport::new()),
            SyncLoopConfig::default(),
        );
        let outcome = sync.sync_now().unwrap();
        assert_eq!(outcome.sent, 1); // peer clock empty, our op goes out
        assert_eq!(outcome.received, 0);
        assert_eq!(sync.status(), SyncStatus::Idle);
        assert_eq!(sync.stats().cycles, 1);
        assert_eq!(sync.stats().ops_sent, 1);
    }

    #[test]
    fn transient_failure_waits_for_retry() {
        let engine = engine();
        let mut transport = MockTransport::new();
        transport.failing = true;
        let sync = SyncLoop::new(engine, Box::new(transport), SyncLoopConfig::default());

        let err = sync.sync_now().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sync.status(), SyncStatus::WaitingRetry);
        assert_eq!(sync.stats().failures, 1);
        assert!(sync.stats().last_error.is_some());
    }

    #[test]
    fn stop_is_honoured() {
        let engine = engine();
        let sync = Arc::new(SyncLoop::new(
            engine,
            Box::new(MockTransport::new()),
            SyncLoopConfig {
                interval: Duration::from_secs(3600),
                ..SyncLoopConfig::default()
            },
        ));

        let handle = {
            let sync = sync.clone();
            std::thread::spawn(move || sync.run())
        };
        std::thread::sleep(Duration::from_millis(150));
        sync.stop();
        handle.join().unwrap();
        assert_eq!(sync.status(), SyncStatus::Stopped);
    }

    #[test]
    fn cycles_are_single_flight() {
        let engine = engine();
        let sync = SyncLoop::new(
            engine,
            Box::new(MockTransport::new()),
            SyncLoopConfig::default(),
        );
        sync.in_flight.store(true, Ordering::SeqCst);
        assert!(matches!(
            sync.sync_now(),
            Err(EngineError::InvalidState(_))
        ));
    }
}
