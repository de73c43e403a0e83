mod distributed;
mod local;

pub use distributed::{DistributedLimiter, MemoryStore};
pub use local::{LocalBuckets, PendingDebits};

use crate::config::{LimitAlgorithm, RateLimitConfig, RateLimitRule};
use crate::error::InfraError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How long degraded mode lasts before the shared store is probed again.
const DEGRADED_PROBE_SECS: u64 = 5;
const DEGRADED_PREFIX: &str = "degraded:";

/// Outcome of one rate-limit check, carrying what the response headers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    /// Whole tokens (or window slots) left after this request.
    pub remaining: u64,
    /// Seconds until the bucket is full again.
    pub reset_after_secs: u64,
    /// Seconds until one request would be admitted. Zero when allowed.
    pub retry_after_secs: u64,
}

/// Seconds needed to accumulate `deficit` tokens at `rate` per second.
pub(crate) fn secs_until(deficit: f64, rate: f64) -> u64 {
    if deficit <= 0.0 || rate <= 0.0 {
        return 0;
    }
    (deficit / rate).ceil() as u64
}

/// Effective limit for one request: a configured rule or the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    pub name: String,
    pub algorithm: LimitAlgorithm,
    pub rate: f64,
    pub capacity: u64,
    pub window: Duration,
    pub max_requests: u64,
}

impl Limit {
    pub fn default_for(cfg: &RateLimitConfig) -> Self {
        Self {
            name: "default".to_string(),
            algorithm: LimitAlgorithm::TokenBucket,
            rate: cfg.default_rate,
            capacity: cfg.default_capacity,
            window: Duration::from_secs(1),
            max_requests: cfg.default_capacity,
        }
    }

    pub fn from_rule(rule: &RateLimitRule) -> Self {
        let window = Duration::from_secs(rule.window_secs.unwrap_or(1).max(1));
        let max_requests = rule.limit.unwrap_or(rule.capacity);
        Self {
            name: rule.name.clone(),
            algorithm: rule.algorithm,
            rate: rule.rate,
            capacity: rule.capacity,
            window,
            max_requests,
        }
    }

    /// Token-bucket shape of this limit, used for degraded-mode fallbacks.
    fn bucket_shape(&self) -> (f64, u64) {
        match self.algorithm {
            LimitAlgorithm::TokenBucket => (self.rate, self.capacity),
            LimitAlgorithm::SlidingWindow => (
                self.max_requests as f64 / self.window.as_secs_f64(),
                self.max_requests,
            ),
        }
    }
}

/// Local fast path in front of the shared limiter, with a conservative
/// local-only fallback while the shared store is failing.
///
/// Token-bucket limits try the local bucket first. A local grant is
/// admitted immediately and the shared bucket is debited in the background;
/// a local denial waits for those debits to land, then escalates to the
/// shared bucket, which has the final say.
/// Sliding-window limits always go to the shared store.
///
/// Any shared-store error switches the limiter into degraded mode for
/// `DEGRADED_PROBE_SECS`. While degraded, every check uses a separate local
/// bucket with the rate and capacity scaled down by the configured factors.
pub struct RateLimiter {
    local: Arc<LocalBuckets>,
    distributed: Arc<DistributedLimiter>,
    use_distributed: bool,
    rate_factor: f64,
    capacity_factor: f64,
    degraded: Arc<DegradedState>,
}

#[derive(Default)]
struct DegradedState {
    until: Mutex<Option<Instant>>,
}

impl DegradedState {
    fn active(&self) -> bool {
        matches!(*self.until.lock(), Some(t) if Instant::now() < t)
    }

    fn trip(&self, err: &InfraError) {
        let mut until = self.until.lock();
        let was_active = matches!(*until, Some(t) if Instant::now() < t);
        *until = Some(Instant::now() + Duration::from_secs(DEGRADED_PROBE_SECS));
        if !was_active {
            tracing::warn!("ratelimit: entering degraded mode, error={}", err);
        }
    }
}

impl RateLimiter {
    pub fn new(
        cfg: &RateLimitConfig,
        local: Arc<LocalBuckets>,
        distributed: Arc<DistributedLimiter>,
    ) -> Self {
        Self {
            local,
            distributed,
            use_distributed: cfg.distributed,
            rate_factor: cfg.degraded_rate_factor,
            capacity_factor: cfg.degraded_capacity_factor,
            degraded: Arc::new(DegradedState::default()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.active()
    }

    pub async fn check(&self, limit: &Limit, key: &str) -> Decision {
        if self.use_distributed && self.degraded.active() {
            return self.check_degraded(limit, key).await;
        }

        match limit.algorithm {
            LimitAlgorithm::TokenBucket => self.check_token_bucket(limit, key).await,
            LimitAlgorithm::SlidingWindow => {
                match self
                    .distributed
                    .check_sliding_window(key, limit.max_requests, limit.window)
                    .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        self.degraded.trip(&e);
                        self.check_degraded(limit, key).await
                    }
                }
            }
        }
    }

    async fn check_token_bucket(&self, limit: &Limit, key: &str) -> Decision {
        if !self.use_distributed {
            return self.local.try_consume(key, limit.rate, limit.capacity).await;
        }

        let (local, debits) = self
            .local
            .try_consume_unflushed(key, limit.rate, limit.capacity)
            .await;
        if local.allowed {
            self.debit_in_background(limit, key, debits);
            return local;
        }

        // The shared bucket must see this instance's own grants before it
        // can judge the escalation.
        debits.settled().await;
        if self.degraded.active() {
            return self.check_degraded(limit, key).await;
        }
        match self
            .distributed
            .check_and_consume(key, limit.rate, limit.capacity, 1)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.degraded.trip(&e);
                self.check_degraded(limit, key).await
            }
        }
    }

    /// Mirror a local admission into the shared bucket so other instances
    /// see it. The result is ignored apart from tripping degraded mode;
    /// `debits` is released once the call returns.
    fn debit_in_background(&self, limit: &Limit, key: &str, debits: PendingDebits) {
        let distributed = Arc::clone(&self.distributed);
        let degraded = Arc::clone(&self.degraded);
        let key = key.to_string();
        let (rate, capacity) = (limit.rate, limit.capacity);
        tokio::spawn(async move {
            if let Err(e) = distributed.check_and_consume(&key, rate, capacity, 1).await {
                degraded.trip(&e);
            }
            drop(debits);
        });
    }

    async fn check_degraded(&self, limit: &Limit, key: &str) -> Decision {
        let (rate, capacity) = limit.bucket_shape();
        let rate = rate * self.rate_factor;
        let capacity = ((capacity as f64 * self.capacity_factor).floor() as u64).max(1);

        metrics::counter!("gateway_rate_limit_degraded_total").increment(1);
        let mut degraded_key = String::with_capacity(DEGRADED_PREFIX.len() + key.len());
        degraded_key.push_str(DEGRADED_PREFIX);
        degraded_key.push_str(key);
        self.local.try_consume(&degraded_key, rate, capacity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    fn limiter(cfg: &RateLimitConfig) -> RateLimiter {
        RateLimiter::new(
            cfg,
            Arc::new(LocalBuckets::new(Duration::from_secs(300))),
            Arc::new(DistributedLimiter::memory("t:")),
        )
    }

    fn bucket(rate: f64, capacity: u64) -> Limit {
        Limit {
            name: "r".to_string(),
            algorithm: LimitAlgorithm::TokenBucket,
            rate,
            capacity,
            window: Duration::from_secs(1),
            max_requests: capacity,
        }
    }

    async fn admitted(rl: &RateLimiter, limit: &Limit, key: &str, n: usize) -> usize {
        let mut allowed = 0;
        for _ in 0..n {
            if rl.check(limit, key).await.allowed {
                allowed += 1;
            }
        }
        allowed
    }

    #[test]
    fn test_secs_until() {
        assert_eq!(secs_until(0.0, 10.0), 0);
        assert_eq!(secs_until(1.0, 10.0), 1);
        assert_eq!(secs_until(20.0, 10.0), 2);
        assert_eq!(secs_until(21.0, 10.0), 3);
        assert_eq!(secs_until(5.0, 0.0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_and_shared_agree() {
        let rl = limiter(&config());
        let limit = bucket(10.0, 20);
        assert_eq!(admitted(&rl, &limit, "user:1", 100).await, 20);
        assert!(!rl.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_local_defers_to_shared() {
        // Two gateway instances share one store. Each local bucket covers
        // its own burst; once it runs dry the shared bucket, drained by the
        // debits of both, decides.
        let cfg = config();
        let shared = Arc::new(DistributedLimiter::memory("t:"));
        let a = RateLimiter::new(&cfg, Arc::new(LocalBuckets::new(Duration::from_secs(300))), shared.clone());
        let b = RateLimiter::new(&cfg, Arc::new(LocalBuckets::new(Duration::from_secs(300))), shared);
        let limit = bucket(10.0, 20);

        let from_a = admitted(&a, &limit, "user:1", 20).await;
        let from_b = admitted(&b, &limit, "user:1", 30).await;
        assert_eq!(from_a, 20);
        assert_eq!(from_b, 20);
        assert!(!b.check(&limit, "user:1").await.allowed);

        tokio::time::advance(Duration::from_secs(1)).await;
        // Both refill 10; a takes them locally and drains the shared bucket,
        // so b's escalation finds nothing left once its own refill is spent.
        assert_eq!(admitted(&a, &limit, "user:1", 10).await, 10);
        assert_eq!(admitted(&b, &limit, "user:1", 15).await, 10);
        assert!(!b.check(&limit, "user:1").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_never_exceeds_capacity() {
        let rl = limiter(&config());
        let limit = bucket(10.0, 20);
        assert_eq!(admitted(&rl, &limit, "ip:1.2.3.4", 1000).await, 20);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(admitted(&rl, &limit, "ip:1.2.3.4", 1000).await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_burst_interleaved() {
        let rl = Arc::new(limiter(&config()));
        let limit = Arc::new(bucket(10.0, 20));
        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let rl = rl.clone();
                let limit = limit.clone();
                tokio::spawn(async move { rl.check(&limit, "ip:1.2.3.4").await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for t in tasks {
            if t.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_on_workers() {
        let rl = Arc::new(limiter(&config()));
        let limit = Arc::new(bucket(10.0, 20));
        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let rl = rl.clone();
                let limit = limit.clone();
                tokio::spawn(async move { rl.check(&limit, "ip:1.2.3.4").await.allowed })
            })
            .collect();

        let mut allowed = 0;
        for t in tasks {
            if t.await.unwrap() {
                allowed += 1;
            }
        }
        // Real clock: both buckets refill 10/s while the burst runs.
        assert!((20..=22).contains(&allowed), "allowed={}", allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_when_store_offline() {
        let rl = limiter(&config());
        rl.distributed.memory_store().unwrap().set_offline(true);
        let limit = bucket(10.0, 20);

        // The local bucket admits its burst before any debit has failed.
        // The first denial sees the failed debits and switches to a bucket
        // of half the capacity.
        assert_eq!(admitted(&rl, &limit, "ip:10.0.0.1", 200).await, 30);
        assert!(rl.is_degraded());

        // Degraded refill is half the rate; the normal bucket is not used.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(admitted(&rl, &limit, "ip:10.0.0.1", 200).await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_mode_expires() {
        let rl = limiter(&config());
        let store = rl.distributed.memory_store().unwrap();
        store.set_offline(true);
        let limit = bucket(10.0, 20);
        admitted(&rl, &limit, "k", 25).await;
        assert!(rl.is_degraded());

        store.set_offline(false);
        tokio::time::advance(Duration::from_secs(DEGRADED_PROBE_SECS + 1)).await;
        assert!(!rl.is_degraded());
        assert!(rl.check(&limit, "k").await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_only_never_degrades() {
        let cfg = RateLimitConfig {
            distributed: false,
            ..config()
        };
        let rl = limiter(&cfg);
        rl.distributed.memory_store().unwrap().set_offline(true);
        assert_eq!(admitted(&rl, &bucket(10.0, 20), "k", 50).await, 20);
        assert!(!rl.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_falls_back() {
        let rl = limiter(&config());
        let limit = Limit {
            name: "w".to_string(),
            algorithm: LimitAlgorithm::SlidingWindow,
            rate: 0.0,
            capacity: 0,
            window: Duration::from_secs(10),
            max_requests: 10,
        };
        assert_eq!(admitted(&rl, &limit, "k", 20).await, 10);

        rl.distributed.memory_store().unwrap().set_offline(true);
        // Degraded bucket: 5 slots at half the window rate.
        assert_eq!(admitted(&rl, &limit, "k2", 20).await, 5);
    }

    #[test]
    fn test_limit_from_rule() {
        let rule = RateLimitRule {
            name: "orders".into(),
            pattern: "/api/orders/**".into(),
            rate: 5.0,
            capacity: 10,
            algorithm: LimitAlgorithm::SlidingWindow,
            window_secs: Some(60),
            limit: Some(100),
        };
        let limit = Limit::from_rule(&rule);
        assert_eq!(limit.window, Duration::from_secs(60));
        assert_eq!(limit.max_requests, 100);
        let (rate, cap) = limit.bucket_shape();
        assert!((rate - 100.0 / 60.0).abs() < 1e-9);
        assert_eq!(cap, 100);
    }
}
