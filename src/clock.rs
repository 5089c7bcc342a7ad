//! Clock and RNG seams so loop timing and retry jitter are injectable in
//! tests: collaborators are passed in as constructor arguments rather
//! than reached for as ambient globals.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only advances when told to.
pub struct FixedClock {
    current: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Mutex::new(start) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        *self.current.lock() += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// A seeded RNG source for deterministic jitter in tests; the production
/// path uses `rand::thread_rng()` directly at the call site instead of
/// going through this trait, since `StdRng` is `Send` but `ThreadRng` is
/// not and the loops need to hold the RNG across an await point.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
