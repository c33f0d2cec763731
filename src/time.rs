use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Monotonic time source injected into the socket.
///
/// `sleep_until` is the suspension primitive used by blocking rate-limited
/// sends; everything else in the core takes `now` explicitly so callers can
/// drive timers from their own event loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep_until(&self, deadline: Instant);
}

/// System clock backed by `Instant::now` and `thread::sleep`.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// A manual clock for deterministic simulations.
#[derive(Debug)]
pub struct ManualClock {
    instant: RwLock<Instant>,
}

impl ManualClock {
    pub fn new(instant: Instant) -> Self {
        Self {
            instant: RwLock::new(instant),
        }
    }

    pub fn set_time(&self, instant: Instant) {
        *self.instant.write().unwrap() = instant;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn sleep_until(&self, deadline: Instant) {
        let mut instant = self.instant.write().unwrap();
        if deadline > *instant {
            *instant = deadline;
        }
    }
}
