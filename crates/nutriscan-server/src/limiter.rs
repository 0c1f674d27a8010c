//! Per-principal rate limiting
//!
//! Two keyed token buckets (per-minute and per-hour) from `governor`,
//! keyed by client IP since the API trusts its network and carries no
//! auth. In-process by default; multi-instance deployments that need a
//! shared budget put a limiter in front instead.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::num::NonZeroU32;
use std::time::Duration;

pub struct RateGate {
    enabled: bool,
    per_minute: DefaultKeyedRateLimiter<String>,
    per_hour: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

impl RateGate {
    pub fn new(enabled: bool, per_minute: u32, per_hour: u32) -> Self {
        let per_minute_quota =
            Quota::per_minute(NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN));
        let per_hour_quota =
            Quota::per_hour(NonZeroU32::new(per_hour.max(1)).unwrap_or(NonZeroU32::MIN));

        Self {
            enabled,
            per_minute: DefaultKeyedRateLimiter::keyed(per_minute_quota),
            per_hour: DefaultKeyedRateLimiter::keyed(per_hour_quota),
            clock: DefaultClock::default(),
        }
    }

    /// Admit or reject one request for `principal`. On rejection, returns
    /// how long the caller should wait (the `Retry-After` hint).
    pub fn check(&self, principal: &str) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }
        let key = principal.to_string();
        let now = self.clock.now();

        let minute = self.per_minute.check_key(&key);
        let hour = self.per_hour.check_key(&key);

        match (minute, hour) {
            (Ok(()), Ok(())) => Ok(()),
            (minute, hour) => {
                let wait = [minute.err(), hour.err()]
                    .into_iter()
                    .flatten()
                    .map(|not_until| not_until.wait_time_from(now))
                    .max()
                    .unwrap_or(Duration::from_secs(1));
                Err(wait)
            }
        }
    }
}
