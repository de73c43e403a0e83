use crate::auth::claims::Claims;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

const SHARDS: usize = 16;

/// Bounded, TTL-limited cache from raw bearer token to verified claims.
///
/// Split into independently locked LRU shards so concurrent lookups for
/// different tokens rarely contend. Entries live for at most `ttl_secs` and
/// never beyond the token's own `exp`; a hit past `exp` removes the entry.
pub struct ClaimsCache {
    shards: Vec<Mutex<LruCache<Arc<str>, Entry>>>,
    ttl_secs: u64,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(Arc<Claims>),
    /// The cached token is past its `exp`. The entry has been removed.
    Expired,
    Miss,
}

struct Entry {
    claims: Arc<Claims>,
    /// Unix seconds; `min(inserted + ttl, exp)`.
    valid_until: u64,
}

impl ClaimsCache {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        let per_shard = NonZeroUsize::new(capacity.div_ceil(SHARDS).max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            ttl_secs,
        }
    }

    fn shard(&self, token: &str) -> &Mutex<LruCache<Arc<str>, Entry>> {
        let mut h = DefaultHasher::new();
        token.hash(&mut h);
        &self.shards[(h.finish() as usize) % SHARDS]
    }

    /// Look up a token. Entries past their TTL or past the token expiry are
    /// dropped; an entry whose token has expired reports `Expired` so the
    /// caller can fail without re-verifying.
    pub fn get(&self, token: &str, now_unix: u64) -> Lookup {
        let mut shard = self.shard(token).lock();
        let Some(entry) = shard.get(token) else {
            return Lookup::Miss;
        };
        if entry.claims.is_expired_at(now_unix) {
            shard.pop(token);
            return Lookup::Expired;
        }
        if now_unix >= entry.valid_until {
            shard.pop(token);
            return Lookup::Miss;
        }
        Lookup::Hit(entry.claims.clone())
    }

    /// Insert verified claims. Claims already expired at `now_unix` are not
    /// cached.
    pub fn insert(&self, token: &str, claims: Arc<Claims>, now_unix: u64) {
        if claims.is_expired_at(now_unix) || self.ttl_secs == 0 {
            return;
        }
        let valid_until = now_unix.saturating_add(self.ttl_secs).min(claims.expires_at);
        self.shard(token)
            .lock()
            .put(Arc::from(token), Entry { claims, valid_until });
    }

    pub fn invalidate(&self, token: &str) -> bool {
        self.shard(token).lock().pop(token).is_some()
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let n = shard.len();
                shard.clear();
                n
            })
            .sum()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.shard(token).lock().contains(token)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
