use crate::kv::KvClient;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Per-user version assignments with a fixed TTL.
///
/// Local entries are authoritative for this instance. With a remote store
/// attached, assignments are written through and a local miss consults the
/// store, so users keep their version across gateway instances. Remote
/// failures are logged and otherwise ignored; while the store is backing
/// off after a failure it is not consulted at all.
pub struct StickyStore {
    local: DashMap<String, (String, Instant)>,
    ttl: Duration,
    remote: Option<(Arc<KvClient>, String)>,
}

impl StickyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            local: DashMap::new(),
            ttl,
            remote: None,
        }
    }

    pub fn with_remote(mut self, kv: Arc<KvClient>, prefix: impl Into<String>) -> Self {
        self.remote = Some((kv, prefix.into()));
        self
    }

    /// The remote store, unless it is backing off after a failure.
    fn live_remote(&self) -> Option<(&KvClient, &str)> {
        let (kv, prefix) = self.remote.as_ref()?;
        if kv.is_backing_off() {
            return None;
        }
        Some((kv.as_ref(), prefix.as_str()))
    }

    fn key(service_id: &str, user_id: &str) -> String {
        let mut k = String::with_capacity(service_id.len() + user_id.len() + 1);
        k.push_str(service_id);
        k.push(':');
        k.push_str(user_id);
        k
    }

    pub async fn get(&self, service_id: &str, user_id: &str) -> Option<String> {
        let key = Self::key(service_id, user_id);
        let now = Instant::now();
        if let Some(entry) = self.local.get(&key) {
            let (version, expires) = entry.value();
            if *expires > now {
                return Some(version.clone());
            }
        }
        self.local.remove_if(&key, |_, (_, expires)| *expires <= now);

        let (kv, prefix) = self.live_remote()?;
        match kv.get(&format!("{}{}", prefix, key)).await {
            Ok(Some(version)) => {
                self.local.insert(key, (version.clone(), now + self.ttl));
                Some(version)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("gray: sticky: remote read failed, key={}, error={}", key, e);
                None
            }
        }
    }

    pub async fn put(&self, service_id: &str, user_id: &str, version: &str) {
        let key = Self::key(service_id, user_id);
        if let Some((kv, prefix)) = self.live_remote() {
            if let Err(e) = kv
                .set_ex(&format!("{}{}", prefix, key), version, self.ttl.as_secs().max(1))
                .await
            {
                tracing::warn!("gray: sticky: remote write failed, key={}, error={}", key, e);
            }
        }
        self.local
            .insert(key, (version.to_string(), Instant::now() + self.ttl));
    }

    /// Drop every local assignment. Remote entries age out on their own.
    pub fn clear(&self) -> usize {
        let n = self.local.len();
        self.local.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.local.retain(|_, (_, expires)| *expires > now);
    }

    /// Spawn a background task that drops expired assignments once a minute.
    /// Stops when `shutdown` is notified.
    pub fn start_gc(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let stop = shutdown.notified();
            tokio::pin!(stop);
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => store.evict_expired(),
                    _ = &mut stop => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_assignment_within_ttl() {
        let s = StickyStore::new(Duration::from_secs(3600));
        assert_eq!(s.get("orders", "u1").await, None);
        s.put("orders", "u1", "v2").await;
        assert_eq!(s.get("orders", "u1").await.as_deref(), Some("v2"));
        assert_eq!(s.get("billing", "u1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assignment_expires() {
        let s = StickyStore::new(Duration::from_secs(60));
        s.put("orders", "u1", "v2").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(s.get("orders", "u1").await, None);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_and_clear() {
        let s = StickyStore::new(Duration::from_secs(60));
        s.put("orders", "u1", "v1").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        s.put("orders", "u2", "v1").await;
        tokio::time::advance(Duration::from_secs(31)).await;
        s.evict_expired();
        assert_eq!(s.len(), 1);
        assert_eq!(s.clear(), 1);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_stops_on_shutdown() {
        let s = Arc::new(StickyStore::new(Duration::from_secs(30)));
        let shutdown = Arc::new(Notify::new());
        s.start_gc(shutdown.clone());
        s.put("orders", "u1", "v1").await;

        tokio::time::sleep(GC_INTERVAL + Duration::from_secs(1)).await;
        assert!(s.is_empty());

        shutdown.notify_waiters();
        tokio::task::yield_now().await;
        s.put("orders", "u2", "v1").await;
        tokio::time::sleep(GC_INTERVAL * 3).await;
        assert_eq!(s.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_remote_does_not_slow_lookups() {
        let kv = crate::kv::stalled_store(300).await;
        let s = StickyStore::new(Duration::from_secs(60)).with_remote(kv.clone(), "t:");

        // The first miss waits out one timeout, then the store is skipped.
        assert_eq!(s.get("orders", "u0").await, None);
        assert!(kv.is_backing_off());

        let started = std::time::Instant::now();
        for i in 1..50 {
            let user = format!("u{}", i);
            assert_eq!(s.get("orders", &user).await, None);
            s.put("orders", &user, "v2").await;
        }
        assert!(started.elapsed() < Duration::from_millis(300));
        // Local assignments keep working.
        assert_eq!(s.get("orders", "u7").await.as_deref(), Some("v2"));
    }
}
