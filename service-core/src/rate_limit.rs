//! Pre-check rate gates.
//!
//! The authority core asks a [`RateGate`] before verifying credentials and
//! before exchanging tokens. What happens when the gate itself is unavailable
//! is the caller's policy; the in-process limiter here never fails.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by an arbitrary identifier (IP, email, client id).
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Gate consulted before an expensive or security-sensitive operation.
pub trait RateGate: Send + Sync {
    /// Returns `true` when `identifier` may proceed within `scope`.
    fn allow(&self, scope: &str, identifier: &str) -> bool;
}

fn quota(attempts: u32, window_seconds: u64) -> Quota {
    let attempts = attempts.max(1);
    let burst = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_millis((window_seconds * 1000) / attempts as u64);
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

/// Create a keyed rate limiter allowing `attempts` per `window_seconds`.
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    Arc::new(RateLimiter::dashmap(quota(attempts, window_seconds)))
}

/// One keyed limiter per named scope.
///
/// Scopes without a configured quota are not limited.
#[derive(Clone, Default)]
pub struct ScopedRateLimiter {
    scopes: Arc<DashMap<String, KeyedRateLimiter>>,
}

impl ScopedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the quota for `scope`.
    pub fn with_scope(self, scope: &str, attempts: u32, window_seconds: u64) -> Self {
        self.scopes.insert(
            scope.to_string(),
            create_keyed_rate_limiter(attempts, window_seconds),
        );
        self
    }
}

impl RateGate for ScopedRateLimiter {
    fn allow(&self, scope: &str, identifier: &str) -> bool {
        let Some(limiter) = self.scopes.get(scope).map(|l| l.clone()) else {
            return true;
        };
        match limiter.check_key(&identifier.to_string()) {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(scope = %scope, "Rate limit exceeded");
                false
            }
        }
    }
}

/// Gate that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RateGate for AllowAll {
    fn allow(&self, _scope: &str, _identifier: &str) -> bool {
        true
    }
}
