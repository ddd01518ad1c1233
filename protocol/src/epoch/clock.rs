//! Time sources.

use std::sync::atomic::{AtomicI64, Ordering};

/// Anything that can tell the current Unix time in seconds.
pub trait Clock: Send + Sync {
    fn unix_timestamp(&self) -> i64;
}

/// Wall-clock time via `chrono`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. Used to walk a vault through its
/// phases in tests and on the devnet node.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jumps to `t`. Going backwards is allowed.
    pub fn set(&self, t: i64) {
        self.now.store(t, Ordering::SeqCst);
    }

    /// Moves forward by `secs` and returns the new time.
    pub fn advance(&self, secs: i64) -> i64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn unix_timestamp(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
