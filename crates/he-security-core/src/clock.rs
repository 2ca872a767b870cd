//! Monotonic time source shared by every engine.
//!
//! Every engine reads "now" through this trait instead of calling
//! `Instant::now()` directly so tests can fast-forward through windows
//! (a 30-minute block duration, an hourly counter reset) without sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait SecurityClock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SecurityClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock the test suite advances manually.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityClock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
