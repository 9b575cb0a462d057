// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic timestamps for captured frames. Production code uses
/// MonotonicClock; tests drive a ManualClock so that frame ages are exact.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock{base: Instant::now(), offset: Mutex::new(Duration::ZERO)}
    }

    /// Moves the clock to `secs` seconds after its creation.
    pub fn set_secs(&self, secs: f64) {
        *self.offset.lock().unwrap() = Duration::from_secs_f64(secs);
    }

    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += delta;
    }

    /// The instant `secs` seconds after this clock's creation.
    pub fn at_secs(&self, secs: f64) -> Instant {
        self.base + Duration::from_secs_f64(secs)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}
