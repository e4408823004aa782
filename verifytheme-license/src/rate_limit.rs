//! Per-actor activation attempt limiting.
//!
//! Each actor (user id or client IP) owns a single expiring [`RateRecord`]
//! in the key-value store. The limit is soft: two concurrent attempts for
//! the same actor may both read the same count before either writes, so at
//! most one extra attempt can slip through per race. Uniqueness of domain
//! bindings is enforced by the remote registry, not here.

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Key prefix for rate records in the store.
pub const RATE_KEY_PREFIX: &str = "verifytheme_rl_";

/// Attempt counter for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    /// Attempts counted in the current window.
    pub count: u32,
    /// Start of the current window (seconds since epoch).
    pub window_start: i64,
}

impl RateRecord {
    /// A fresh, empty window starting at `now`.
    #[must_use]
    pub fn fresh(now: i64) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn elapsed(&self, now: i64) -> i64 {
        now.saturating_sub(self.window_start)
    }
}

/// Attempt budget applied to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Attempts allowed per window. Zero denies everything.
    pub max_attempts: u32,
    /// Window length in seconds. Must be positive.
    pub window_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 60 * 60,
        }
    }
}

/// Fixed-window rate limiter over an expiring key-value store.
pub struct RateLimiter<S, C> {
    store: S,
    clock: C,
}

impl<S: KeyValueStore, C: Clock> RateLimiter<S, C> {
    /// Creates a limiter backed by `store`.
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    /// Records an attempt by `actor_key` and returns whether it is allowed.
    ///
    /// `Ok(false)` is the denial outcome. A zero `window_secs` is rejected
    /// with [`LicenseError::Config`] before the store is touched.
    pub fn allow(&self, actor_key: &str, max_attempts: u32, window_secs: u64) -> LicenseResult<bool> {
        if window_secs == 0 {
            return Err(LicenseError::Config(
                "rate limit window must be positive".to_string(),
            ));
        }
        let window = i64::try_from(window_secs)
            .map_err(|_| LicenseError::Config(format!("rate limit window too large: {window_secs}")))?;

        let now = self.clock.now();
        let key = record_key(actor_key);
        let mut record = self
            .store
            .get_json::<RateRecord>(&key)?
            .unwrap_or_else(|| RateRecord::fresh(now));

        if record.elapsed(now) > window {
            record = RateRecord::fresh(now);
        }

        let ttl = remaining_secs(&record, now, window);

        if record.count >= max_attempts {
            self.store.set_json(&key, &record, Some(ttl))?;
            warn!(actor = actor_key, count = record.count, "activation attempt rate limited");
            return Ok(false);
        }

        record.count += 1;
        self.store.set_json(&key, &record, Some(ttl))?;
        debug!(actor = actor_key, count = record.count, max_attempts, "activation attempt allowed");
        Ok(true)
    }

    /// [`allow`](Self::allow) with a policy.
    pub fn check(&self, actor_key: &str, policy: &RateLimitPolicy) -> LicenseResult<bool> {
        self.allow(actor_key, policy.max_attempts, policy.window_secs)
    }

    /// Seconds until `actor_key`'s current window resets, or `None` when the
    /// actor has no live record.
    pub fn retry_after(&self, actor_key: &str, window_secs: u64) -> LicenseResult<Option<u64>> {
        let window = i64::try_from(window_secs)
            .map_err(|_| LicenseError::Config(format!("rate limit window too large: {window_secs}")))?;
        let now = self.clock.now();
        let record = self.store.get_json::<RateRecord>(&record_key(actor_key))?;
        Ok(record
            .filter(|r| r.elapsed(now) <= window)
            .map(|r| remaining_secs(&r, now, window)))
    }

    /// Current record for `actor_key`, if any.
    pub fn record(&self, actor_key: &str) -> LicenseResult<Option<RateRecord>> {
        self.store.get_json(&record_key(actor_key))
    }
}

fn record_key(actor_key: &str) -> String {
    format!("{RATE_KEY_PREFIX}{actor_key}")
}

/// Time left in the window, floored at one second so a record written on
/// the window boundary still persists.
fn remaining_secs(record: &RateRecord, now: i64, window: i64) -> u64 {
    u64::try_from(window.saturating_sub(record.elapsed(now)).max(1)).unwrap_or(1)
}
