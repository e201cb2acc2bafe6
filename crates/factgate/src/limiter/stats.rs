use crate::limiter::Dimension;
use portable_atomic::{AtomicU64, Ordering};

/// Counters for one [`TokenBucketLimiter`].
///
/// Every store error the limiter absorbs and every state transition it makes
/// is counted here, so nothing is swallowed silently even without an
/// exporter attached.
///
/// [`TokenBucketLimiter`]: crate::TokenBucketLimiter
#[derive(Debug, Default)]
pub struct LimiterStats {
    admitted: AtomicU64,
    rejected: [AtomicU64; 3],
    failovers: AtomicU64,
    failbacks: AtomicU64,
    health_checks: AtomicU64,
    health_failures: AtomicU64,
    store_errors: AtomicU64,
}

impl LimiterStats {
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Requests denied along `dimension`. A request denied on several
    /// dimensions counts once on each.
    pub fn rejected(&self, dimension: Dimension) -> u64 {
        self.rejected[dimension.index()].load(Ordering::Relaxed)
    }

    /// PRIMARY to FALLBACK transitions.
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// FALLBACK to PRIMARY transitions.
    pub fn failbacks(&self) -> u64 {
        self.failbacks.load(Ordering::Relaxed)
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }

    pub fn health_failures(&self) -> u64 {
        self.health_failures.load(Ordering::Relaxed)
    }

    /// Remote store errors absorbed by the limiter.
    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self, dimension: Dimension) {
        self.rejected[dimension.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failback(&self) {
        self.failbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_health_check(&self, healthy: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !healthy {
            self.health_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}
