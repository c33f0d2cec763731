//! Leaky-bucket rate regulation for the outbound data and repair paths.
//!
//! The bucket is amortised over millisecond periods when the rate allows a
//! full TPDU per millisecond, otherwise over seconds. A zero rate disables
//! the limiter.

use crate::time::Clock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    rate_per_sec: i64,
    /// Nonzero selects millisecond fill periods.
    rate_per_msec: i64,
    iphdr_len: usize,
    last_rate_check: Instant,
    /// Remaining bytes this period; goes negative on a blocking overdraft.
    rate_limit: i64,
}

impl Bucket {
    /// Refill from elapsed time, capped at one period's allowance, then
    /// debit the packet. Returns the prospective balance without
    /// committing.
    fn prospective_limit(&self, now: Instant, data_size: usize) -> i64 {
        let elapsed = now.saturating_duration_since(self.last_rate_check);
        let new_limit = if self.rate_per_msec != 0 {
            if elapsed > Duration::from_millis(1) {
                self.rate_per_msec
            } else {
                let refill = self.rate_per_msec * elapsed.as_micros() as i64 / 1000;
                (self.rate_limit + refill).min(self.rate_per_msec)
            }
        } else if elapsed > Duration::from_secs(1) {
            self.rate_per_sec
        } else {
            let refill = self.rate_per_sec * elapsed.as_micros() as i64 / 1_000_000;
            (self.rate_limit + refill).min(self.rate_per_sec)
        };
        new_limit - (self.iphdr_len + data_size) as i64
    }

    /// Time needed to refill a deficit of `-limit` bytes.
    fn deficit_sleep(&self, limit: i64) -> Duration {
        debug_assert!(limit < 0);
        let micros = (-limit) as u64 * 1_000_000 / self.rate_per_sec.max(1) as u64;
        Duration::from_micros(micros + 1)
    }
}

/// A single leaky bucket guarding one traffic class.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u64, iphdr_len: usize, max_tpdu: u16, now: Instant) -> Self {
        let rate_per_sec = rate_per_sec as i64;
        let rate_per_msec = if rate_per_sec / 1000 >= i64::from(max_tpdu) {
            rate_per_sec / 1000
        } else {
            0
        };
        // Pre-fill one period.
        let rate_limit = if rate_per_msec != 0 {
            rate_per_msec
        } else {
            rate_per_sec
        };
        Self {
            bucket: Mutex::new(Bucket {
                rate_per_sec,
                rate_per_msec,
                iphdr_len,
                last_rate_check: now,
                rate_limit,
            }),
            enabled: rate_per_sec > 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit `data_size` bytes. Nonblocking refusal leaves the bucket
    /// untouched; a blocking overdraft commits, then sleeps the deficit off.
    pub fn check(&self, clock: &dyn Clock, data_size: usize, nonblocking: bool) -> bool {
        if !self.enabled {
            return true;
        }
        let deficit;
        {
            let mut bucket = self.bucket.lock().unwrap();
            let now = clock.now();
            let new_limit = bucket.prospective_limit(now, data_size);
            if nonblocking && new_limit < 0 {
                return false;
            }
            bucket.rate_limit = new_limit;
            bucket.last_rate_check = now;
            if new_limit >= 0 {
                return true;
            }
            deficit = bucket.deficit_sleep(new_limit);
        }
        // Sleep outside the lock; the balance recovers from elapsed time on
        // the next check.
        let deadline = clock.now() + deficit;
        clock.sleep_until(deadline);
        true
    }
}

/// Two-bucket admission for repair traffic: the aggregate (major) bucket is
/// tested and committed first so its accounting stays atomic, then the
/// repair (minor) bucket, which sleeps outside the major's lock.
pub fn check2(
    major: &RateLimiter,
    minor: &RateLimiter,
    clock: &dyn Clock,
    data_size: usize,
    nonblocking: bool,
) -> bool {
    if !major.enabled && !minor.enabled {
        return true;
    }
    let mut major_deficit = None;
    if major.enabled {
        let mut bucket = major.bucket.lock().unwrap();
        let now = clock.now();
        let new_limit = bucket.prospective_limit(now, data_size);
        if nonblocking && new_limit < 0 {
            return false;
        }
        if minor.enabled {
            // Peek the minor bucket before committing the major, so a
            // nonblocking refusal leaves both untouched.
            let minor_bucket = minor.bucket.lock().unwrap();
            if nonblocking && minor_bucket.prospective_limit(now, data_size) < 0 {
                return false;
            }
        }
        bucket.rate_limit = new_limit;
        bucket.last_rate_check = now;
        if new_limit < 0 {
            major_deficit = Some(bucket.deficit_sleep(new_limit));
        }
    } else if minor.enabled {
        let bucket = minor.bucket.lock().unwrap();
        if nonblocking && bucket.prospective_limit(clock.now(), data_size) < 0 {
            return false;
        }
    }

    if let Some(deficit) = major_deficit {
        let deadline = clock.now() + deficit;
        clock.sleep_until(deadline);
    }

    if minor.enabled {
        let deficit;
        {
            let mut bucket = minor.bucket.lock().unwrap();
            let now = clock.now();
            let new_limit = bucket.prospective_limit(now, data_size);
            if nonblocking && new_limit < 0 {
                return false;
            }
            bucket.rate_limit = new_limit;
            bucket.last_rate_check = now;
            if new_limit >= 0 {
                return true;
            }
            deficit = bucket.deficit_sleep(new_limit);
        }
        let deadline = clock.now() + deficit;
        clock.sleep_until(deadline);
    }
    true
}
