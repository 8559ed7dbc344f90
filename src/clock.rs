//! Monotonic time source.
//!
//! Engines never read the time themselves: the driving loop asks a [`Clock`]
//! and hands the reading to the state machine. Production code uses
//! [`SystemClock`] (tokio's clock, so paused-time tests work); machine-level
//! tests use [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Source of monotonic instants with millisecond-relevant resolution.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The tokio clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Opaque 4-byte wire timestamp: milliseconds since `epoch`, truncated.
pub fn wire_timestamp(epoch: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(epoch).as_millis() as u32
}

/// Whole milliseconds between two instants, saturating at zero.
pub fn millis_between(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_millis() as u64
}
