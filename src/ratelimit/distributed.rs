use super::{secs_until, Decision};
use crate::error::InfraError;
use crate::kv::KvClient;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Refill-and-take in one round trip. Tokens are stored as a decimal string
/// so fractional refills survive between calls. The key expires after twice
/// the bucket's fill time.
const TOKEN_BUCKET_LUA: &str = r"
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * rate / 1000)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', KEYS[1], math.ceil(capacity / rate * 2000))
return {allowed, tostring(tokens)}
";

/// Sorted-set log of admission times. Returns admitted flag, entries in the
/// window, and milliseconds until the oldest entry leaves the window.
const SLIDING_WINDOW_LUA: &str = r"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])

local allowed = 0
if count < limit then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    count = count + 1
    allowed = 1
end
redis.call('PEXPIRE', KEYS[1], window)

local reset = window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
    reset = tonumber(oldest[2]) + window - now
end
return {allowed, count, reset}
";

/// Shared-state limiter consulted when the local bucket runs dry, and for
/// every sliding-window rule. Backed by Redis in production; the in-process
/// store runs the same algorithms for single-instance deployments.
pub struct DistributedLimiter {
    store: Store,
    prefix: String,
}

enum Store {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl DistributedLimiter {
    pub fn redis(kv: Arc<KvClient>, prefix: impl Into<String>) -> Self {
        Self {
            store: Store::Redis(RedisStore {
                kv,
                bucket_script: redis::Script::new(TOKEN_BUCKET_LUA),
                window_script: redis::Script::new(SLIDING_WINDOW_LUA),
            }),
            prefix: prefix.into(),
        }
    }

    pub fn memory(prefix: impl Into<String>) -> Self {
        Self {
            store: Store::Memory(MemoryStore::default()),
            prefix: prefix.into(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.store {
            Store::Redis(_) => "redis",
            Store::Memory(_) => "memory",
        }
    }

    /// The in-process store, when that is the backend.
    pub fn memory_store(&self) -> Option<&MemoryStore> {
        match &self.store {
            Store::Memory(m) => Some(m),
            Store::Redis(_) => None,
        }
    }

    /// Atomic token-bucket check. Takes `requested` tokens when available.
    pub async fn check_and_consume(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
        requested: u64,
    ) -> Result<Decision, InfraError> {
        let full_key = format!("{}{}", self.prefix, key);
        let (allowed, tokens) = match &self.store {
            Store::Redis(r) => r.token_bucket(&full_key, rate, capacity, requested).await?,
            Store::Memory(m) => m.token_bucket(&full_key, rate, capacity, requested)?,
        };
        Ok(Decision {
            allowed,
            limit: capacity,
            remaining: tokens.max(0.0).floor() as u64,
            reset_after_secs: secs_until(capacity as f64 - tokens, rate),
            retry_after_secs: if allowed {
                0
            } else {
                secs_until(requested as f64 - tokens, rate).max(1)
            },
        })
    }

    /// Exact sliding-window check: admit while fewer than `limit` requests
    /// were admitted in the trailing `window`.
    pub async fn check_sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision, InfraError> {
        let full_key = format!("{}{}", self.prefix, key);
        let (allowed, count, reset) = match &self.store {
            Store::Redis(r) => r.sliding_window(&full_key, limit, window).await?,
            Store::Memory(m) => m.sliding_window(&full_key, limit, window)?,
        };
        let reset_secs = reset.as_millis().div_ceil(1000) as u64;
        Ok(Decision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after_secs: reset_secs,
            retry_after_secs: if allowed { 0 } else { reset_secs.max(1) },
        })
    }
}

struct RedisStore {
    kv: Arc<KvClient>,
    bucket_script: redis::Script,
    window_script: redis::Script,
}

impl RedisStore {
    async fn token_bucket(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
        requested: u64,
    ) -> Result<(bool, f64), InfraError> {
        let now = wall_clock_ms();
        let (allowed, tokens): (i64, String) = self
            .kv
            .run("redis token bucket", |mut conn| async move {
                self.bucket_script
                    .key(key)
                    .arg(rate)
                    .arg(capacity)
                    .arg(now)
                    .arg(requested)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| InfraError::StoreUnavailable(format!("bad token count: {}", e)))?;
        Ok((allowed == 1, tokens))
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(bool, u64, Duration), InfraError> {
        let now = wall_clock_ms();
        let window_ms = window.as_millis().max(1) as u64;
        let member = format!("{}-{}", now, rand::random::<u32>());
        let (allowed, count, reset): (i64, i64, i64) = self
            .kv
            .run("redis sliding window", |mut conn| async move {
                self.window_script
                    .key(key)
                    .arg(limit)
                    .arg(window_ms)
                    .arg(now)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok((
            allowed == 1,
            count.max(0) as u64,
            Duration::from_millis(reset.max(0) as u64),
        ))
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-process stand-in for the shared store. Same algorithms and expiry
/// rules as the Lua scripts; can be switched offline to exercise fallback
/// paths.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    offline: AtomicBool,
}

enum MemoryEntry {
    Bucket {
        tokens: f64,
        last: Instant,
        expires: Instant,
    },
    Window {
        hits: VecDeque<Instant>,
        expires: Instant,
    },
}

const MEMORY_MAX_ENTRIES: usize = 100_000;

impl MemoryStore {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_online(&self) -> Result<(), InfraError> {
        if self.is_offline() {
            return Err(InfraError::StoreUnavailable("memory store offline".to_string()));
        }
        if self.entries.len() > MEMORY_MAX_ENTRIES {
            let now = Instant::now();
            self.entries.retain(|_, e| e.expires() > now);
        }
        Ok(())
    }

    fn token_bucket(
        &self,
        key: &str,
        rate: f64,
        capacity: u64,
        requested: u64,
    ) -> Result<(bool, f64), InfraError> {
        self.ensure_online()?;
        let now = Instant::now();
        let capacity_f = capacity as f64;
        let ttl = Duration::from_secs_f64((capacity_f / rate.max(f64::MIN_POSITIVE) * 2.0).min(86_400.0));

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::Bucket {
                tokens: capacity_f,
                last: now,
                expires: now + ttl,
            });
        if entry.expires() <= now || !matches!(*entry, MemoryEntry::Bucket { .. }) {
            *entry = MemoryEntry::Bucket {
                tokens: capacity_f,
                last: now,
                expires: now + ttl,
            };
        }

        let MemoryEntry::Bucket {
            tokens,
            last,
            expires,
        } = &mut *entry
        else {
            return Err(InfraError::StoreUnavailable("memory store entry type".to_string()));
        };
        let elapsed = now.saturating_duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * rate).min(capacity_f);
        *last = now;
        *expires = now + ttl;

        let allowed = *tokens >= requested as f64;
        if allowed {
            *tokens -= requested as f64;
        }
        Ok((allowed, *tokens))
    }

    fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(bool, u64, Duration), InfraError> {
        self.ensure_online()?;
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::Window {
                hits: VecDeque::new(),
                expires: now + window,
            });
        if !matches!(*entry, MemoryEntry::Window { .. }) {
            *entry = MemoryEntry::Window {
                hits: VecDeque::new(),
                expires: now + window,
            };
        }

        let MemoryEntry::Window { hits, expires } = &mut *entry else {
            return Err(InfraError::StoreUnavailable("memory store entry type".to_string()));
        };
        while hits
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            hits.pop_front();
        }

        let allowed = (hits.len() as u64) < limit;
        if allowed {
            hits.push_back(now);
        }
        *expires = now + window;

        let reset = hits
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(window);
        Ok((allowed, hits.len() as u64, reset))
    }
}

impl MemoryEntry {
    fn expires(&self) -> Instant {
        match self {
            MemoryEntry::Bucket { expires, .. } | MemoryEntry::Window { expires, .. } => *expires,
        }
    }
}
