use super::{secs_until, Decision};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Fixed-point scale for fractional tokens.
const PRECISION: u64 = 1_000_000;
/// GC runs every this many seconds.
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap on tracked keys. When exceeded, the least recently used buckets
/// are force-evicted regardless of idle time.
const MAX_ENTRIES: usize = 100_000;

/// In-process token buckets, one per key, created full on first use.
///
/// Each bucket sits behind its own `tokio::sync::Mutex`; distinct keys never
/// contend and waiting for a busy bucket yields to the runtime.
pub struct LocalBuckets {
    buckets: DashMap<String, Arc<Bucket>>,
    epoch: Instant,
    idle_ttl: Duration,
}

struct Bucket {
    inner: Mutex<BucketInner>,
    /// Microseconds since `LocalBuckets::epoch`. Updated outside the lock.
    last_access: AtomicU64,
    /// Local grants whose shared-bucket debit has not finished yet.
    /// Incremented under `inner`, so a denial observes every earlier grant.
    unflushed: AtomicU64,
    flushed: Notify,
}

/// Outstanding shared-bucket debits of one local bucket.
///
/// Returned by [`LocalBuckets::try_consume_unflushed`]. On a grant the handle
/// owns one unflushed debit, released when it is dropped; on a denial it owns
/// nothing and [`PendingDebits::settled`] waits for earlier grants to flush.
pub struct PendingDebits {
    bucket: Arc<Bucket>,
    owned: bool,
}

impl PendingDebits {
    /// Wait until every debit started before this handle was created has
    /// been released.
    pub async fn settled(&self) {
        loop {
            let notified = self.bucket.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let outstanding = self.bucket.unflushed.load(Ordering::Acquire);
            if outstanding <= u64::from(self.owned) {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for PendingDebits {
    fn drop(&mut self) {
        if self.owned && self.bucket.unflushed.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.bucket.flushed.notify_waiters();
        }
    }
}

struct BucketInner {
    /// Scaled by `PRECISION`; always within `[0, capacity * PRECISION]`.
    tokens: u64,
    last_refill: Instant,
}

impl LocalBuckets {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            epoch: Instant::now(),
            idle_ttl,
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Refill the bucket for `key` and try to take one token.
    pub async fn try_consume(&self, key: &str, rate: f64, capacity: u64) -> Decision {
        self.consume(key, rate, capacity, false).await.0
    }

    /// Like [`try_consume`](Self::try_consume), for a bucket that mirrors its
    /// grants into a shared bucket. A grant is counted as unflushed until the
    /// returned handle is dropped.
    pub async fn try_consume_unflushed(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
    ) -> (Decision, PendingDebits) {
        let (decision, bucket) = self.consume(key, rate, capacity, true).await;
        let owned = decision.allowed;
        (decision, PendingDebits { bucket, owned })
    }

    async fn consume(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
        track: bool,
    ) -> (Decision, Arc<Bucket>) {
        let capacity = capacity.max(1);
        let max_tokens = capacity * PRECISION;

        // Fast path: key already exists, no allocation.
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: Instant::now(),
                        }),
                        last_access: AtomicU64::new(self.now_us()),
                        unflushed: AtomicU64::new(0),
                        flushed: Notify::new(),
                    })
                })
                .clone()
        };
        bucket.last_access.store(self.now_us(), Ordering::Relaxed);

        let mut b = bucket.inner.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last_refill);
        if !elapsed.is_zero() {
            let refill = (elapsed.as_secs_f64() * rate.max(0.0) * PRECISION as f64) as u64;
            b.tokens = b.tokens.saturating_add(refill).min(max_tokens);
            b.last_refill = now;
        }
        // A rule may have shrunk since the bucket was created.
        b.tokens = b.tokens.min(max_tokens);

        let allowed = b.tokens >= PRECISION;
        if allowed {
            b.tokens -= PRECISION;
            if track {
                bucket.unflushed.fetch_add(1, Ordering::AcqRel);
            }
        }

        let tokens = b.tokens as f64 / PRECISION as f64;
        let decision = Decision {
            allowed,
            limit: capacity,
            remaining: b.tokens / PRECISION,
            reset_after_secs: secs_until(capacity as f64 - tokens, rate),
            retry_after_secs: if allowed {
                0
            } else {
                secs_until(1.0 - tokens, rate).max(1)
            },
        };
        drop(b);
        (decision, bucket)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Spawn a background task that periodically evicts idle buckets. Stops
    /// when `shutdown` is notified.
    pub fn start_gc(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let buckets = Arc::clone(self);
        tokio::spawn(async move {
            let stop = shutdown.notified();
            tokio::pin!(stop);
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => buckets.evict_stale(),
                    _ = &mut stop => return,
                }
            }
        });
    }

    /// Remove buckets idle for longer than `idle_ttl`, then force-evict the
    /// oldest ones if the map is still over `MAX_ENTRIES`.
    pub fn evict_stale(&self) {
        let now = self.now_us();
        let expire_us = self.idle_ttl.as_micros() as u64;
        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        if self.buckets.len() > MAX_ENTRIES {
            self.force_evict(now, MAX_ENTRIES);
        }
    }

    fn force_evict(&self, now: u64, cap: usize) {
        let overflow = self.buckets.len().saturating_sub(cap);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(String, u64)> = self
            .buckets
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (r.key().clone(), age)
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            self.buckets.remove(&key);
        }
        tracing::debug!("ratelimit: local: force-evicted buckets, count={}", overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets() -> LocalBuckets {
        LocalBuckets::new(Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let b = buckets();
        let mut allowed = 0;
        for _ in 0..50 {
            if b.try_consume("k", 10.0, 20).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let b = buckets();
        for _ in 0..20 {
            b.try_consume("k", 10.0, 20).await;
        }
        assert!(!b.try_consume("k", 10.0, 20).await.allowed);

        tokio::time::advance(Duration::from_millis(500)).await;
        let mut allowed = 0;
        for _ in 0..20 {
            if b.try_consume("k", 10.0, 20).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_after_capacity_over_rate() {
        let b = buckets();
        for _ in 0..20 {
            b.try_consume("k", 10.0, 20).await;
        }
        // capacity / rate = 2s; waiting longer never overfills.
        tokio::time::advance(Duration::from_secs(10)).await;
        let d = b.try_consume("k", 10.0, 20).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_headers() {
        let b = buckets();
        let d = b.try_consume("k", 10.0, 20).await;
        assert_eq!(d.limit, 20);
        assert_eq!(d.remaining, 19);
        assert_eq!(d.reset_after_secs, 1);
        assert_eq!(d.retry_after_secs, 0);

        for _ in 0..19 {
            b.try_consume("k", 10.0, 20).await;
        }
        let d = b.try_consume("k", 10.0, 20).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs, 1);
        assert_eq!(d.reset_after_secs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_independent() {
        let b = buckets();
        assert!(b.try_consume("a", 1.0, 1).await.allowed);
        assert!(!b.try_consume("a", 1.0, 1).await.allowed);
        assert!(b.try_consume("b", 1.0, 1).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_buckets() {
        let b = LocalBuckets::new(Duration::from_secs(60));
        b.try_consume("old", 1.0, 1).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        b.try_consume("fresh", 1.0, 1).await;
        b.evict_stale();
        assert_eq!(b.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unflushed_grants_hold_back_denials() {
        let b = buckets();
        let (d, first) = b.try_consume_unflushed("k", 1.0, 1).await;
        assert!(d.allowed);

        let (d, denied) = b.try_consume_unflushed("k", 1.0, 1).await;
        assert!(!d.allowed);
        let waiter = tokio::spawn(async move { denied.settled().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_returns_when_nothing_pending() {
        let b = buckets();
        let (d, debits) = b.try_consume_unflushed("k", 1.0, 1).await;
        assert!(d.allowed);
        drop(debits);
        let (_, denied) = b.try_consume_unflushed("k", 1.0, 1).await;
        denied.settled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_stops_on_shutdown() {
        let b = Arc::new(LocalBuckets::new(Duration::from_secs(60)));
        let shutdown = Arc::new(Notify::new());
        b.start_gc(shutdown.clone());
        b.try_consume("old", 1.0, 1).await;

        tokio::time::sleep(Duration::from_secs(GC_INTERVAL_SECS + 1)).await;
        assert_eq!(b.len(), 0);

        // Let the loop park on its next tick before signalling.
        tokio::task::yield_now().await;
        shutdown.notify_waiters();
        tokio::task::yield_now().await;
        b.try_consume("later", 1.0, 1).await;
        tokio::time::sleep(Duration::from_secs(GC_INTERVAL_SECS * 3)).await;
        assert_eq!(b.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_evict_oldest() {
        let b = buckets();
        for i in 0..10 {
            b.try_consume(&format!("k{}", i), 1.0, 1).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        b.force_evict(b.now_us(), 4);
        assert_eq!(b.len(), 4);
        assert!(b.buckets.contains_key("k9"));
        assert!(!b.buckets.contains_key("k0"));
    }
}
