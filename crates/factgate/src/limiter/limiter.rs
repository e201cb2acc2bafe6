//! Multi-dimension token-bucket admission control.
//!
//! [`TokenBucketLimiter`] evaluates up to three quotas (API key, address,
//! organization) for every request and consumes tokens only if all of them
//! allow it. Bucket state lives in a shared remote store when one is
//! configured; any transport failure switches the limiter to its private
//! [`MemoryStore`] until the remote passes a health probe again.
//!
//! ## Fail-over state machine
//!
//! - `PRIMARY -> FALLBACK`: a remote bucket operation fails, or a periodic
//!   health probe fails. The fallback window is `now + fallback_timeout`.
//!   While degraded, nothing is written to the remote store.
//! - `FALLBACK -> FALLBACK`: a failed fail-back probe extends the window;
//!   nothing ever shortens it.
//! - `FALLBACK -> PRIMARY`: once the window has elapsed, the next request
//!   probes the remote store. On success the local buckets are copied to the
//!   remote store (so the outage does not hand out a free refill) and the
//!   remote becomes authoritative again.
//!
//! Probes, in either state, run at most once per `health_check_interval`,
//! and never two at a time.
//!
//! The fail-over state is locked only to read the mode and to apply a
//! transition. Store I/O runs unlocked, so requests for different identities
//! interleave freely.

use crate::{
    error::{Error, Result},
    limiter::{
        BucketState, Dimension, FailoverState, Identity, LimiterConfig, LimiterStats, RateQuota,
        StoreMode,
    },
    store::{MemoryStore, StorageBackend, StoreFactory},
    time::Clock,
};
use core::fmt;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One quota's bucket as observed while evaluating a request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketReading {
    pub dimension: Dimension,
    /// Tokens left after this evaluation.
    pub tokens: f64,
    pub allowed: bool,
}

/// The outcome of an admitted request.
#[derive(Clone, Debug, PartialEq)]
pub struct Admission {
    /// Sum of the bursts of every enabled quota.
    pub limit: u64,
    /// Sum of the whole tokens left across enabled quotas.
    pub remaining: u64,
    pub buckets: Vec<BucketReading>,
}

/// Why a request was denied and when to come back.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub limit: u64,
    pub remaining: u64,
    /// Whole seconds until every denying quota has a token again; at least 1.
    pub retry_after: u64,
    pub denied: Vec<Dimension>,
    pub buckets: Vec<BucketReading>,
}

/// Admission-control gate with transparent remote/local fail-over.
pub struct TokenBucketLimiter {
    config: LimiterConfig,
    remote: Option<Arc<StoreFactory>>,
    local: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<FailoverState>,
    probing: AtomicBool,
    stats: Arc<LimiterStats>,
}

/// Holds the single health-probe slot; releases it on drop.
struct ProbeSlot<'a>(&'a AtomicBool);

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.config)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl TokenBucketLimiter {
    /// Creates a limiter backed by `remote`, or by a local store only when
    /// `remote` is `None`.
    ///
    /// The local fallback store shares `clock`, so its TTLs follow the same
    /// time line as the buckets.
    pub fn new(config: LimiterConfig, remote: Option<Arc<StoreFactory>>, clock: Arc<dyn Clock>) -> Self {
        let local = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        let state = FailoverState::new(clock.now());
        Self {
            config,
            remote,
            local,
            clock,
            state: Mutex::new(state),
            probing: AtomicBool::new(false),
            stats: Arc::new(LimiterStats::default()),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<LimiterStats> {
        Arc::clone(&self.stats)
    }

    /// The instance-local store used when no remote is authoritative.
    pub fn local_store(&self) -> &MemoryStore {
        &self.local
    }

    pub fn remote_factory(&self) -> Option<&Arc<StoreFactory>> {
        self.remote.as_ref()
    }

    pub fn failover_state(&self) -> FailoverState {
        *self.state.lock()
    }

    pub fn mode(&self) -> StoreMode {
        if self.remote.is_none() {
            StoreMode::Local
        } else if self.using_fallback() {
            StoreMode::Fallback
        } else {
            StoreMode::Primary
        }
    }

    /// Evaluates every enabled quota for `identity` and consumes one token
    /// from each only if all of them allow the request.
    ///
    /// Store failures never surface here: they flip the limiter into
    /// fallback and the request is evaluated against the local store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] when at least one quota denies the
    /// request. No quota is charged in that case.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn check_and_consume(&self, identity: &Identity) -> Result<Admission> {
        let enabled: Vec<(Dimension, RateQuota, String)> = Dimension::ALL
            .iter()
            .map(|d| (*d, *self.config.quota(*d)))
            .filter(|(_, quota)| quota.is_enabled())
            .map(|(d, quota)| (d, quota, d.bucket_key(identity.get(d))))
            .collect();
        let limit = self.config.total_burst();

        if enabled.is_empty() {
            self.stats.record_admitted();
            return Ok(Admission {
                limit,
                remaining: 0,
                buckets: Vec::new(),
            });
        }

        let now = self.clock.now();
        self.maybe_check_health(now).await;

        // Phase 1: probe every quota without consuming.
        let mut probes = Vec::with_capacity(enabled.len());
        for (dimension, quota, key) in &enabled {
            let (bucket, allowed) = self.take(key, quota, now, false).await;
            probes.push((
                BucketReading {
                    dimension: *dimension,
                    tokens: bucket.tokens,
                    allowed,
                },
                bucket.retry_after(quota),
            ));
        }

        if probes.iter().any(|(reading, _)| !reading.allowed) {
            let denied: Vec<Dimension> = probes
                .iter()
                .filter(|(reading, _)| !reading.allowed)
                .map(|(reading, _)| reading.dimension)
                .collect();
            let retry_after = probes
                .iter()
                .filter(|(reading, _)| !reading.allowed)
                .map(|(_, wait)| *wait)
                .max()
                .unwrap_or(1);
            for dimension in &denied {
                self.stats.record_rejected(*dimension);
            }
            let buckets: Vec<BucketReading> = probes.into_iter().map(|(r, _)| r).collect();
            #[cfg(feature = "tracing")]
            tracing::debug!(?denied, retry_after, "request rejected");
            return Err(Error::QuotaExceeded(Rejection {
                limit,
                remaining: remaining(&buckets),
                retry_after,
                denied,
                buckets,
            }));
        }

        // Phase 2: every quota allowed; commit.
        let mut buckets = Vec::with_capacity(enabled.len());
        for (dimension, quota, key) in &enabled {
            let (bucket, allowed) = self.take(key, quota, now, true).await;
            buckets.push(BucketReading {
                dimension: *dimension,
                tokens: bucket.tokens,
                allowed,
            });
        }
        self.stats.record_admitted();

        Ok(Admission {
            limit,
            remaining: remaining(&buckets),
            buckets,
        })
    }

    /// Runs one bucket step against the authoritative store, failing over to
    /// the local store if the remote one errors.
    async fn take(&self, key: &str, quota: &RateQuota, now: f64, consume: bool) -> (BucketState, bool) {
        let using_fallback = self.using_fallback();
        if let Some(factory) = self.remote.as_deref().filter(|_| !using_fallback) {
            match self.take_remote(factory, key, quota, now, consume).await {
                Ok(outcome) => return outcome,
                Err(e) => self.fail_over(now, &e),
            }
        }
        self.take_local(key, quota, now, consume)
    }

    fn using_fallback(&self) -> bool {
        self.state.lock().using_fallback
    }

    async fn take_remote(
        &self,
        factory: &StoreFactory,
        key: &str,
        quota: &RateQuota,
        now: f64,
        consume: bool,
    ) -> Result<(BucketState, bool)> {
        let store = factory.get().await?;
        let previous = BucketState::decode(&store.get_all(key).await?);
        let (bucket, allowed) = BucketState::step(previous, quota, now, consume);
        store.set_with_ttl(key, &bucket.encode(), self.config.ttl).await?;
        Ok((bucket, allowed))
    }

    fn take_local(&self, key: &str, quota: &RateQuota, now: f64, consume: bool) -> (BucketState, bool) {
        let previous = BucketState::decode(&self.local.read(key));
        let (bucket, allowed) = BucketState::step(previous, quota, now, consume);
        self.local.write(key, &bucket.encode());
        self.local.set_ttl(key, self.config.ttl);
        (bucket, allowed)
    }

    fn fail_over(&self, now: f64, _reason: &dyn fmt::Display) {
        self.stats.record_store_error();
        let until = now + self.config.fallback_timeout.as_secs_f64();
        let entered = self.state.lock().degrade(until);
        if entered {
            self.stats.record_failover();
            #[cfg(feature = "tracing")]
            tracing::warn!(
                fallback_secs = self.config.fallback_timeout.as_secs_f64(),
                "remote store unavailable, serving buckets locally: {_reason}"
            );
        }
    }

    /// Probes the remote store if a probe is due and no other is running.
    async fn maybe_check_health(&self, now: f64) {
        let Some(factory) = &self.remote else {
            return;
        };
        let Some(_slot) = self.claim_probe(now) else {
            return;
        };

        let probe = self.probe(factory).await;

        if !self.using_fallback() {
            if let Err(e) = probe {
                self.fail_over(now, &e);
            }
            return;
        }

        let restored = match probe {
            Ok(store) => self.seed_remote(store.as_ref()).await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(_seeded) => {
                self.state.lock().restore();
                self.local.clear();
                self.stats.record_failback();
                #[cfg(feature = "tracing")]
                tracing::info!(seeded = _seeded, "remote store healthy again, resuming primary");
            }
            Err(e) => self.fail_over(now, &e),
        }
    }

    /// Takes the probe slot and stamps the probe time if a probe is due at
    /// `now`.
    fn claim_probe(&self, now: f64) -> Option<ProbeSlot<'_>> {
        let mut state = self.state.lock();
        if now - state.last_health_check < self.config.health_check_interval.as_secs_f64() {
            return None;
        }
        if state.using_fallback && !state.window_elapsed(now) {
            return None;
        }
        self.probing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        state.last_health_check = now;
        Some(ProbeSlot(&self.probing))
    }

    async fn probe(&self, factory: &StoreFactory) -> Result<Arc<dyn StorageBackend>> {
        let result = match factory.get().await {
            Ok(store) if store.ping().await => Ok(store),
            Ok(store) => Err(Error::unavailable(store.name(), "health probe failed")),
            Err(e) => Err(e),
        };
        self.stats.record_health_check(result.is_ok());
        result
    }

    /// Copies every live local bucket to the remote store.
    async fn seed_remote(&self, store: &dyn StorageBackend) -> Result<usize> {
        let snapshot = self.local.snapshot();
        let mut seeded = 0;
        for entry in snapshot {
            let ttl = entry.ttl.unwrap_or(self.config.ttl);
            if ttl.is_zero() {
                continue;
            }
            store.set_with_ttl(&entry.key, &entry.fields, ttl).await?;
            seeded += 1;
        }
        Ok(seeded)
    }
}

fn remaining(buckets: &[BucketReading]) -> u64 {
    buckets
        .iter()
        .map(|b| b.tokens.max(0.0).floor() as u64)
        .sum()
}
