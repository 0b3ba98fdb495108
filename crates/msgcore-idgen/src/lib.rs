//! IDGen: 64-bit packed id generator, spec §4.5.
//!
//! Layout: `[1 bit reserved | 41 bits ms timestamp | 10 bits node id | 12 bits sequence]`.
//! Monotonic within a node; roughly monotonic globally across nodes sharing
//! a clock source.

pub mod lease;

use std::sync::Mutex;

use msgcore_common::{MessageId, Severity, severity::Classify};
use thiserror::Error;
use tracing::warn;

pub use lease::{FileLeaseCoordinator, NodeLease, StaticNodeLease};

/// Custom epoch (2024-01-01T00:00:00Z in ms) so the 41-bit timestamp field
/// has headroom for ~69 years from a recent date instead of from Unix epoch.
pub const CUSTOM_EPOCH_MS: u64 = 1_704_067_200_000;

const TIMESTAMP_BITS: u32 = 41;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

const MAX_NODE_ID: u64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Beyond this much backward clock movement, refuse to allocate (spec §4.5).
const MAX_REGRESSION_MS: u64 = 5;

#[derive(Debug, Error)]
pub enum IdGenError {
    #[error("clock regressed by {0}ms, exceeding the {MAX_REGRESSION_MS}ms tolerance")]
    ClockRegression(u64),
    #[error("node id {0} exceeds the 10-bit range")]
    NodeIdOutOfRange(u64),
    #[error("no node id available: {0}")]
    LeaseFailed(String),
}

impl Classify for IdGenError {
    fn severity(&self) -> Severity {
        match self {
            // Caller retries per spec §4.5 ("on regression... return an
            // error (caller retries)").
            IdGenError::ClockRegression(_) => Severity::Transient,
            IdGenError::NodeIdOutOfRange(_) => Severity::Fatal,
            IdGenError::LeaseFailed(_) => Severity::Fatal,
        }
    }
}

/// Injectable clock so tests can simulate regression without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time relative to [`CUSTOM_EPOCH_MS`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        msgcore_common::now_ms().saturating_sub(CUSTOM_EPOCH_MS)
    }
}

struct State {
    last_ts: u64,
    sequence: u64,
}

/// Stateful id generator bound to one node id. Cheap to share behind an
/// `Arc` — internal mutability is a single short-held mutex around the
/// timestamp/sequence pair.
pub struct IdGenerator {
    node_id: u64,
    clock: Box<dyn Clock>,
    state: Mutex<State>,
}

impl IdGenerator {
    pub fn new(node_id: u64) -> Result<Self, IdGenError> {
        Self::with_clock(node_id, Box::new(SystemClock))
    }

    pub fn with_clock(node_id: u64, clock: Box<dyn Clock>) -> Result<Self, IdGenError> {
        if node_id > MAX_NODE_ID {
            return Err(IdGenError::NodeIdOutOfRange(node_id));
        }
        Ok(Self {
            node_id,
            clock,
            state: Mutex::new(State {
                last_ts: 0,
                sequence: 0,
            }),
        })
    }

    /// Allocate the next id. Synchronous and lock-bounded to a handful of
    /// instructions in the common case — safe to call from async code
    /// without spawn_blocking.
    pub fn next(&self) -> Result<MessageId, IdGenError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = self.clock.now_ms();

        if now < state.last_ts {
            let regression = state.last_ts - now;
            if regression > MAX_REGRESSION_MS {
                return Err(IdGenError::ClockRegression(regression));
            }
            warn!(regression_ms = regression, "clock regressed briefly, spinning");
            while now < state.last_ts {
                std::hint::spin_loop();
                now = self.clock.now_ms();
            }
        }

        if now == state.last_ts {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; wait for the
                // next tick rather than overflow into the node/timestamp bits.
                while now <= state.last_ts {
                    std::hint::spin_loop();
                    now = self.clock.now_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ts = now;

        let id = (now << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence;
        Ok(MessageId(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;

    struct FakeClock(Arc<AtomicU64>);

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn gen_with_shared_clock(node_id: u64) -> (IdGenerator, Arc<AtomicU64>) {
        let ticks = Arc::new(AtomicU64::new(1_000));
        let gen = IdGenerator::with_clock(node_id, Box::new(FakeClock(Arc::clone(&ticks)))).unwrap();
        (gen, ticks)
    }

    #[test]
    fn ids_are_monotonic_within_a_node() {
        let gen = IdGenerator::new(3).unwrap();
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = gen.next().unwrap().0;
            assert!(id > last, "ids must strictly increase");
            last = id;
        }
    }

    #[test]
    fn sequence_rolls_within_one_tick() {
        let (gen, _ticks) = gen_with_shared_clock(1);
        let first = gen.next().unwrap().0;
        let second = gen.next().unwrap().0;
        assert_eq!(second, first + 1);
    }

    #[test]
    fn rejects_node_id_out_of_range() {
        let err = IdGenerator::new(1 << 10).unwrap_err();
        assert!(matches!(err, IdGenError::NodeIdOutOfRange(_)));
    }

    #[test]
    fn brief_regression_spins_until_clock_catches_up() {
        let (gen, ticks) = gen_with_shared_clock(1);
        let first = gen.next().unwrap().0;
        // Regress by 2ms (within the 5ms tolerance), then let it recover on
        // a background thread while `next()` spins.
        ticks.store(998, Ordering::SeqCst);
        let ticks2 = Arc::clone(&ticks);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            ticks2.store(1_001, Ordering::SeqCst);
        });
        let second = gen.next().unwrap().0;
        handle.join().unwrap();
        assert!(second > first);
    }

    #[test]
    fn large_regression_is_refused() {
        let (gen, ticks) = gen_with_shared_clock(1);
        let _ = gen.next().unwrap();
        ticks.store(900, Ordering::SeqCst);
        let err = gen.next().unwrap_err();
        assert!(matches!(err, IdGenError::ClockRegression(_)));
    }
}
