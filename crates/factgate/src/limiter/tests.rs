use crate::{
    Admission, Clock, Dimension, Error, Fields, Identity, LimiterConfig, ManualClock, MemoryStore,
    RateQuota, StorageBackend, StoreFactory, StoreMode, TokenBucketLimiter, error::Result,
};
use async_trait::async_trait;
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// A remote store whose data path and health probe can be broken
/// independently.
#[derive(Debug)]
struct FlakyStore {
    inner: MemoryStore,
    ops_down: AtomicBool,
    ping_down: AtomicBool,
    fail_next: AtomicUsize,
    ops: AtomicUsize,
    pings: AtomicUsize,
}

impl FlakyStore {
    fn new(clock: &ManualClock) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            ops_down: AtomicBool::new(false),
            ping_down: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            ops: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        })
    }

    fn set_down(&self, down: bool) {
        self.ops_down.store(down, Ordering::SeqCst);
        self.ping_down.store(down, Ordering::SeqCst);
    }

    fn op(&self) -> Result<()> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.ops_down.load(Ordering::SeqCst) {
            return Err(Error::unavailable("flaky", "connection refused"));
        }
        Ok(())
    }

    fn ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get_all(&self, key: &str) -> Result<Fields> {
        self.op()?;
        Ok(self.inner.read(key))
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<()> {
        self.op()?;
        self.inner.write(key, fields);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.op()?;
        self.inner.set_ttl(key, ttl);
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        !self.ping_down.load(Ordering::SeqCst)
    }
}

/// A healthy remote store where every bucket operation takes `latency`.
#[derive(Debug)]
struct SlowStore {
    inner: MemoryStore,
    latency: Duration,
}

#[async_trait]
impl StorageBackend for SlowStore {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn get_all(&self, key: &str) -> Result<Fields> {
        tokio::time::sleep(self.latency).await;
        Ok(self.inner.read(key))
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        self.inner.write(key, fields);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        self.inner.set_ttl(key, ttl);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        tokio::time::sleep(self.latency).await;
        self.inner.write(key, fields);
        self.inner.set_ttl(key, ttl);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

fn factory_for<S: StorageBackend + 'static>(store: &Arc<S>) -> Arc<StoreFactory> {
    let store = Arc::clone(store);
    Arc::new(StoreFactory::new(
        "rate_limit",
        move || {
            let store = Arc::clone(&store);
            async move { Ok(store as Arc<dyn StorageBackend>) }
        },
        1,
        Duration::ZERO,
    ))
}

fn key_only(burst: u32, sustain: f64) -> LimiterConfig {
    LimiterConfig {
        api: RateQuota::new(burst, sustain).unwrap(),
        ip: RateQuota::disabled(),
        org: RateQuota::disabled(),
        ttl: Duration::from_secs(300),
        fallback_timeout: Duration::from_secs(30),
        health_check_interval: Duration::from_secs(5),
    }
}

fn local_limiter(config: LimiterConfig, clock: &ManualClock) -> TokenBucketLimiter {
    TokenBucketLimiter::new(config, None, Arc::new(clock.clone()))
}

fn remote_limiter(
    config: LimiterConfig,
    clock: &ManualClock,
    store: &Arc<FlakyStore>,
) -> TokenBucketLimiter {
    TokenBucketLimiter::new(config, Some(factory_for(store)), Arc::new(clock.clone()))
}

fn who(key: &str) -> Identity {
    Identity::new(key, "10.0.0.1", "acme")
}

fn tokens_of(fields: &Fields) -> f64 {
    fields["tokens"].parse().unwrap()
}

fn rejection(result: Result<Admission>) -> crate::Rejection {
    match result {
        Err(Error::QuotaExceeded(rejection)) => rejection,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test]
fn quota_rejects_unusable_sustain() {
    for sustain in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            RateQuota::new(10, sustain),
            Err(Error::InvalidQuota { .. })
        ));
    }
    assert!(RateQuota::new(0, 0.5).is_ok());
    assert!(!RateQuota::disabled().is_enabled());
}

#[test]
fn bucket_keys_are_namespaced_by_dimension() {
    assert_eq!(Dimension::ApiKey.bucket_key("k1"), "rl:key:k1");
    assert_eq!(Dimension::Ip.bucket_key("1.2.3.4"), "rl:ip:1.2.3.4");
    assert_eq!(Dimension::Org.bucket_key("acme"), "rl:org:acme");
}

#[tokio::test]
async fn burst_then_refill() {
    let clock = ManualClock::new(1_000.0);
    let limiter = local_limiter(key_only(2, 1.0), &clock);

    assert!(limiter.check_and_consume(&who("k")).await.is_ok());
    assert!(limiter.check_and_consume(&who("k")).await.is_ok());

    let denied = rejection(limiter.check_and_consume(&who("k")).await);
    assert_eq!(denied.retry_after, 1);
    assert_eq!(denied.denied, vec![Dimension::ApiKey]);
    assert_eq!(denied.remaining, 0);

    clock.advance(1.0);
    let admitted = limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(admitted.remaining, 0);
    assert_eq!(limiter.stats().admitted(), 3);
    assert_eq!(limiter.stats().rejected(Dimension::ApiKey), 1);
}

#[tokio::test]
async fn retry_after_reflects_slow_refill() {
    let clock = ManualClock::new(0.0);
    let limiter = local_limiter(key_only(1, 0.25), &clock);

    limiter.check_and_consume(&who("k")).await.unwrap();
    let denied = rejection(limiter.check_and_consume(&who("k")).await);
    assert_eq!(denied.retry_after, 4);
}

#[tokio::test]
async fn identities_do_not_share_buckets() {
    let clock = ManualClock::new(0.0);
    let limiter = local_limiter(key_only(1, 1.0), &clock);

    limiter.check_and_consume(&who("a")).await.unwrap();
    limiter.check_and_consume(&who("b")).await.unwrap();
    assert!(limiter.check_and_consume(&who("a")).await.is_err());
}

#[tokio::test]
async fn tokens_follow_refill_formula() {
    let clock = ManualClock::new(50.0);
    let (burst, sustain) = (3u32, 0.5);
    let limiter = local_limiter(key_only(burst, sustain), &clock);
    let steps = [0.0, 0.0, 0.0, 0.0, 0.7, 1.3, 0.1, 4.0, 0.0, 0.0, 0.0, 10.0, 0.25];

    let mut tokens = f64::from(burst);
    let mut last = clock.now();
    for dt in steps {
        clock.advance(dt);
        let now = clock.now();
        tokens = (tokens + (now - last) * sustain).min(f64::from(burst));
        last = now;
        let expect_allowed = tokens >= 1.0;
        if expect_allowed {
            tokens -= 1.0;
        }

        let result = limiter.check_and_consume(&who("k")).await;
        assert_eq!(result.is_ok(), expect_allowed, "after advancing {dt}s");

        let stored = tokens_of(&limiter.local_store().read("rl:key:k"));
        assert!((stored - tokens).abs() < 1e-9, "stored {stored}, expected {tokens}");
        assert!(stored <= f64::from(burst));
    }
}

#[tokio::test]
async fn denied_requests_charge_no_quota() {
    let clock = ManualClock::new(0.0);
    let config = LimiterConfig {
        ip: RateQuota::new(1, 0.001).unwrap(),
        ..key_only(5, 0.001)
    };
    let limiter = local_limiter(config, &clock);
    let first = Identity::new("k", "10.0.0.1", "acme");
    let other_ip = Identity::new("k", "10.0.0.2", "acme");

    limiter.check_and_consume(&first).await.unwrap();
    let denied = rejection(limiter.check_and_consume(&first).await);
    assert_eq!(denied.denied, vec![Dimension::Ip]);
    assert_eq!(limiter.stats().rejected(Dimension::ApiKey), 0);
    assert_eq!(limiter.stats().rejected(Dimension::Ip), 1);

    let key_tokens = tokens_of(&limiter.local_store().read("rl:key:k"));
    assert!((key_tokens - 4.0).abs() < 0.01);

    limiter.check_and_consume(&other_ip).await.unwrap();
    let key_tokens = tokens_of(&limiter.local_store().read("rl:key:k"));
    assert!((key_tokens - 3.0).abs() < 0.01);
}

#[tokio::test]
async fn admission_reports_summed_limits() {
    let clock = ManualClock::new(0.0);
    let limiter = local_limiter(LimiterConfig::default(), &clock);

    let admitted = limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(admitted.limit, 60 + 120 + 600);
    assert_eq!(admitted.remaining, 59 + 119 + 599);
    assert_eq!(admitted.buckets.len(), 3);
}

#[tokio::test]
async fn disabled_quotas_skip_the_store() {
    let clock = ManualClock::new(0.0);
    let config = LimiterConfig {
        api: RateQuota::disabled(),
        ..key_only(1, 1.0)
    };
    let limiter = local_limiter(config, &clock);

    for _ in 0..10 {
        let admitted = limiter.check_and_consume(&who("k")).await.unwrap();
        assert_eq!(admitted.limit, 0);
    }
    assert!(limiter.local_store().is_empty());
}

#[test]
fn zero_ttl_is_rejected() {
    let config = LimiterConfig {
        ttl: Duration::ZERO,
        ..key_only(2, 1.0)
    };
    assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    assert!(key_only(2, 1.0).validate().is_ok());
    assert!(LimiterConfig::default().validate().is_ok());
}

#[tokio::test(start_paused = true)]
async fn admissions_for_different_identities_overlap() {
    let clock = ManualClock::new(0.0);
    let remote = Arc::new(SlowStore {
        inner: MemoryStore::with_clock(Arc::new(clock.clone())),
        latency: Duration::from_millis(20),
    });
    let limiter = TokenBucketLimiter::new(
        LimiterConfig::default(),
        Some(factory_for(&remote)),
        Arc::new(clock.clone()),
    );

    // One request: 3 quotas x 2 phases x (read + write).
    let single = Duration::from_millis(3 * 2 * 2 * 20);
    let identities: Vec<Identity> = (0..4)
        .map(|i| Identity::new(format!("k{i}"), format!("10.0.0.{i}"), format!("org{i}")))
        .collect();

    let started = tokio::time::Instant::now();
    let results =
        futures::future::join_all(identities.iter().map(|who| limiter.check_and_consume(who)))
            .await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(Result::is_ok));
    assert!(elapsed < single * 2, "admissions ran one after another: {elapsed:?}");
    assert_eq!(limiter.mode(), StoreMode::Primary);
    assert_eq!(limiter.stats().admitted(), 4);
}

#[tokio::test]
async fn local_only_limiter_reports_local_mode() {
    let limiter = local_limiter(key_only(1, 1.0), &ManualClock::new(0.0));
    assert_eq!(limiter.mode(), StoreMode::Local);
}

#[tokio::test]
async fn buckets_live_in_remote_store_when_healthy() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    let limiter = remote_limiter(key_only(3, 1.0), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(limiter.mode(), StoreMode::Primary);
    assert!((tokens_of(&remote.inner.read("rl:key:k")) - 2.0).abs() < 1e-9);
    assert!(limiter.local_store().is_empty());
}

#[tokio::test]
async fn store_error_fails_over_transparently() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    remote.fail_next.store(1, Ordering::SeqCst);
    let limiter = remote_limiter(key_only(3, 1.0), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(limiter.mode(), StoreMode::Fallback);
    let state = limiter.failover_state();
    assert_eq!(state.fallback_until, Some(30.0));

    let ops = remote.ops();
    limiter.check_and_consume(&who("k")).await.unwrap();
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert!(limiter.check_and_consume(&who("k")).await.is_err());
    assert_eq!(remote.ops(), ops, "no remote I/O while degraded");

    let stats = limiter.stats();
    assert_eq!(stats.failovers(), 1);
    assert_eq!(stats.store_errors(), 1);
    assert_eq!(stats.admitted(), 3);
}

#[tokio::test]
async fn failed_ping_fails_over() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    let limiter = remote_limiter(key_only(10, 1.0), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();
    remote.ping_down.store(true, Ordering::SeqCst);

    clock.advance(4.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 0);
    assert_eq!(limiter.mode(), StoreMode::Primary);

    clock.advance(1.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 1);
    assert_eq!(limiter.mode(), StoreMode::Fallback);
    assert_eq!(limiter.stats().health_failures(), 1);
}

#[tokio::test]
async fn fail_back_waits_for_window() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    remote.set_down(true);
    let limiter = remote_limiter(key_only(100, 1.0), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(limiter.mode(), StoreMode::Fallback);
    remote.set_down(false);

    for t in [10.0, 20.0, 29.9] {
        clock.set(t);
        limiter.check_and_consume(&who("k")).await.unwrap();
        assert_eq!(remote.pings(), 0, "probed early at t={t}");
        assert_eq!(limiter.mode(), StoreMode::Fallback);
    }

    clock.set(30.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 1);
    assert_eq!(limiter.mode(), StoreMode::Primary);
    assert_eq!(limiter.stats().failbacks(), 1);

    clock.set(31.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 1);
}

#[tokio::test]
async fn failed_fail_back_extends_window() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    remote.set_down(true);
    let limiter = remote_limiter(key_only(100, 1.0), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();

    clock.set(30.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 1);
    let state = limiter.failover_state();
    assert!(state.using_fallback);
    assert_eq!(state.fallback_until, Some(60.0));

    remote.set_down(false);
    clock.set(45.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 1);

    clock.set(60.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(remote.pings(), 2);
    assert_eq!(limiter.mode(), StoreMode::Primary);
    assert_eq!(limiter.stats().failovers(), 1);
}

#[tokio::test]
async fn fail_back_seeds_remote_from_local_buckets() {
    let clock = ManualClock::new(0.0);
    let remote = FlakyStore::new(&clock);
    remote.set_down(true);
    let limiter = remote_limiter(key_only(3, 0.01), &clock, &remote);

    limiter.check_and_consume(&who("k")).await.unwrap();
    limiter.check_and_consume(&who("k")).await.unwrap();
    remote.set_down(false);

    clock.set(30.0);
    limiter.check_and_consume(&who("k")).await.unwrap();
    assert_eq!(limiter.mode(), StoreMode::Primary);
    assert!(limiter.local_store().is_empty());

    // 1 token left at the outage's end, +0.3 refilled, -1 consumed.
    let tokens = tokens_of(&remote.inner.read("rl:key:k"));
    assert!((tokens - 0.3).abs() < 1e-6, "remote has {tokens}");
    assert!(limiter.check_and_consume(&who("k")).await.is_err());
}
