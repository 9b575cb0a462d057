// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Single-slot wake signal raised by the producer after every frame.
///
/// A notification raised while nobody waits is kept until the next wait, but
/// notifications do not accumulate: any number of notify() calls between two
/// waits release exactly one wait. Each notification releases at most one
/// waiter; the waiter consumes the slot.
pub struct FrameSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        FrameSignal{raised: Mutex::new(false), cond: Condvar::new()}
    }

    pub fn notify(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = true;
        self.cond.notify_one();
    }

    /// Blocks until the slot is raised, then clears it.
    pub fn wait(&self) {
        let mut raised = self.raised.lock().unwrap();
        while !*raised {
            raised = self.cond.wait(raised).unwrap();
        }
        *raised = false;
    }

    /// Like wait(), but gives up after `timeout`. Returns false on timeout,
    /// leaving the slot untouched.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock().unwrap();
        while !*raised {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return false;
            }
            raised = self.cond.wait_timeout(raised, remaining).unwrap().0;
        }
        *raised = false;
        true
    }

    /// Discards a pending notification, if any.
    pub fn clear(&self) {
        *self.raised.lock().unwrap() = false;
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap()
    }
}

impl Default for FrameSignal {
    fn default() -> Self {
        Self::new()
    }
}
