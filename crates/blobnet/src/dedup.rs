use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::clock::Clock;

/// Lazy gate for work which must run at most once per interval, checked on
/// hot paths instead of driven by a timer. The fast path is a read lock;
/// the interval is re-checked after upgrading to a write lock so exactly
/// one caller runs the task.
pub struct IntervalTrap {
    clock: Arc<dyn Clock>,
    interval: Duration,
    prev: RwLock<Instant>,
}

impl IntervalTrap {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let prev = RwLock::new(clock.now());
        Self { clock, interval, prev }
    }

    fn ready(&self, prev: Instant) -> bool {
        self.clock.now() > prev + self.interval
    }

    /// Runs `task` if the interval has passed since the last run.
    pub fn trap(&self, task: impl FnOnce()) {
        if !self.ready(*self.prev.read()) {
            return;
        }
        let mut prev = self.prev.write();
        if !self.ready(*prev) {
            return;
        }
        task();
        *prev = self.clock.now();
    }
}
