use crate::config::RedisConfig;
use crate::error::InfraError;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Instant};

/// After a failed call, further calls fail immediately for this long.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Shared Redis handle for the distributed limiter and remote sticky
/// assignments.
///
/// The connection is established on first use and then reused; the
/// `ConnectionManager` reconnects on its own after failures. Every command
/// runs under `timeout`, and a timeout is reported the same way as any
/// other store failure. After any failure the client backs off for
/// `FAILURE_BACKOFF`: calls fail at once instead of waiting on a store that
/// is down.
pub struct KvClient {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
    connect_timeout: Duration,
    backoff_until: Mutex<Option<Instant>>,
}

impl KvClient {
    pub fn new(cfg: &RedisConfig, url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| anyhow::anyhow!("invalid redis url '{}': {}", url, e))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms.max(1)),
            backoff_until: Mutex::new(None),
        })
    }

    /// Build a client from config; `None` when no URL is configured.
    pub fn from_config(cfg: &RedisConfig) -> anyhow::Result<Option<Self>> {
        match cfg.url.as_deref() {
            Some(url) if !url.is_empty() => Ok(Some(Self::new(cfg, url)?)),
            _ => Ok(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, InfraError> {
        self.conn
            .get_or_try_init(|| async {
                match timeout(self.connect_timeout, ConnectionManager::new(self.client.clone())).await {
                    Ok(Ok(conn)) => {
                        tracing::info!("kv: connected");
                        Ok(conn)
                    }
                    Ok(Err(e)) => Err(InfraError::from(e)),
                    Err(_) => Err(InfraError::Timeout("redis connect")),
                }
            })
            .await
            .cloned()
    }

    /// True while calls are short-circuited after a recent failure.
    pub fn is_backing_off(&self) -> bool {
        matches!(*self.backoff_until.lock(), Some(t) if Instant::now() < t)
    }

    fn record_failure(&self, err: &InfraError) {
        let mut until = self.backoff_until.lock();
        let already = matches!(*until, Some(t) if Instant::now() < t);
        *until = Some(Instant::now() + FAILURE_BACKOFF);
        if !already {
            tracing::warn!(
                "kv: store failing, backing off, backoff_secs={}, error={}",
                FAILURE_BACKOFF.as_secs(),
                err
            );
        }
    }

    /// Run one operation against the store under the command timeout.
    pub async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, InfraError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        if self.is_backing_off() {
            return Err(InfraError::StoreUnavailable(format!(
                "{} skipped, store backing off",
                op
            )));
        }
        let result = match self.connection().await {
            Ok(conn) => match timeout(self.timeout, f(conn)).await {
                Ok(result) => result.map_err(InfraError::from),
                Err(_) => Err(InfraError::Timeout(op)),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        self.run("redis get", |mut conn| async move { conn.get(key).await })
            .await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), InfraError> {
        self.run("redis set", |mut conn| async move {
            conn.set_ex(key, value, ttl_secs).await
        })
        .await
    }

    pub async fn ping(&self) -> Result<(), InfraError> {
        self.run("redis ping", |mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await.map(|_| ())
        })
        .await
    }
}
