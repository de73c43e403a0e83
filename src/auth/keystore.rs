use crate::auth::jwk::{parse_jwks, VerificationKey};
use crate::config::IssuerConfig;
use crate::error::InfraError;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Issuer → kid → key, plus a kid → issuer index for direct lookup.
/// Replaced wholesale on every change; readers never see a partial update.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    by_issuer: HashMap<String, HashMap<String, Arc<VerificationKey>>>,
    kid_index: HashMap<String, String>,
}

impl KeySet {
    pub fn get(&self, issuer: &str, kid: &str) -> Option<&Arc<VerificationKey>> {
        self.by_issuer.get(issuer)?.get(kid)
    }

    pub fn issuer_count(&self) -> usize {
        self.by_issuer.len()
    }

    pub fn key_count(&self) -> usize {
        self.by_issuer.values().map(HashMap::len).sum()
    }

    fn with_issuer(&self, issuer: &str, keys: HashMap<String, Arc<VerificationKey>>) -> Self {
        let mut next = self.clone();
        next.kid_index.retain(|_, owner| owner != issuer);
        for kid in keys.keys() {
            next.kid_index
                .entry(kid.clone())
                .or_insert_with(|| issuer.to_string());
        }
        next.by_issuer.insert(issuer.to_string(), keys);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another refresh was running or one finished too recently.
    Skipped,
    Completed { loaded: usize, failed: usize },
}

/// Verification keys per issuer, fetched from JWKS endpoints.
///
/// Lookups are lock-free loads of the current `KeySet`. Refreshes fetch
/// every issuer concurrently and swap in the result one issuer at a time;
/// an issuer whose fetch fails keeps its previous keys.
pub struct KeyStore {
    keys: ArcSwap<KeySet>,
    issuers: Vec<IssuerConfig>,
    http: reqwest::Client,
    refreshing: AtomicBool,
    last_refresh: parking_lot::Mutex<Option<(Instant, SystemTime)>>,
    min_gap: Duration,
}

impl KeyStore {
    pub fn new(
        issuers: Vec<IssuerConfig>,
        fetch_timeout: Duration,
        min_gap: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .connect_timeout(fetch_timeout)
            .build()?;
        Ok(Self {
            keys: ArcSwap::from_pointee(KeySet::default()),
            issuers,
            http,
            refreshing: AtomicBool::new(false),
            last_refresh: parking_lot::Mutex::new(None),
            min_gap,
        })
    }

    /// Fetch one issuer's JWKS and install it. Returns the resulting key set.
    pub async fn load(&self, issuer: &str, jwks_uri: &str) -> Result<Arc<KeySet>, InfraError> {
        let fetch_err = |reason: String| InfraError::JwksFetch {
            issuer: issuer.to_string(),
            reason,
        };

        let resp = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InfraError::Timeout("jwks fetch")
                } else {
                    fetch_err(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("status {}", resp.status())));
        }
        let body = resp.text().await.map_err(|e| fetch_err(e.to_string()))?;
        self.load_document(issuer, &body)
    }

    /// Install keys for `issuer` from a JWKS document already in hand.
    pub fn load_document(&self, issuer: &str, body: &str) -> Result<Arc<KeySet>, InfraError> {
        let parsed = parse_jwks(body).map_err(|reason| InfraError::JwksFetch {
            issuer: issuer.to_string(),
            reason,
        })?;
        let keys: HashMap<String, Arc<VerificationKey>> = parsed
            .into_iter()
            .map(|k| (k.kid.clone(), Arc::new(k)))
            .collect();
        let count = keys.len();

        self.keys.rcu(|current| current.with_issuer(issuer, keys.clone()));
        tracing::info!("auth: keystore: issuer loaded, issuer={}, keys={}", issuer, count);
        Ok(self.keys.load_full())
    }

    pub fn get(&self, issuer: &str, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.load().get(issuer, kid).cloned()
    }

    /// Find a key by kid. Kids are only unique per issuer, so the issuer the
    /// token claims is tried first; otherwise the kid index decides, and
    /// every issuer is scanned only when the index has no entry. The caller
    /// still has to check the token against the returned issuer.
    pub fn find(&self, kid: &str, issuer_hint: Option<&str>) -> Option<(String, Arc<VerificationKey>)> {
        let set = self.keys.load();
        if let Some(hint) = issuer_hint {
            if let Some(k) = set.get(hint, kid) {
                return Some((hint.to_string(), k.clone()));
            }
        }
        if let Some(issuer) = set.kid_index.get(kid) {
            if let Some(k) = set.get(issuer, kid) {
                return Some((issuer.clone(), k.clone()));
            }
        }
        self.issuers.iter().find_map(|i| {
            set.get(&i.name, kid)
                .map(|k| (i.name.clone(), k.clone()))
        })
    }

    /// Reload every configured issuer. Overlapping calls never run
    /// concurrently; a non-forced call is also skipped when the previous
    /// refresh finished less than `min_gap` ago.
    pub async fn refresh_all(&self, force: bool) -> RefreshOutcome {
        if !force {
            if let Some((at, _)) = *self.last_refresh.lock() {
                if at.elapsed() < self.min_gap {
                    return RefreshOutcome::Skipped;
                }
            }
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefreshOutcome::Skipped;
        }
        let _guard = RefreshGuard(&self.refreshing);

        let results = futures_util::future::join_all(
            self.issuers
                .iter()
                .map(|i| async move { (i, self.load(&i.name, &i.jwks_uri).await) }),
        )
        .await;

        let mut loaded = 0;
        let mut failed = 0;
        for (issuer, result) in results {
            match result {
                Ok(_) => loaded += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        "auth: keystore: refresh failed, issuer={}, error={}",
                        issuer.name,
                        e
                    );
                }
            }
        }

        metrics::counter!("gateway_jwks_refresh_total", "result" => "success").increment(loaded as u64);
        if failed > 0 {
            metrics::counter!("gateway_jwks_refresh_total", "result" => "error")
                .increment(failed as u64);
        }

        *self.last_refresh.lock() = Some((Instant::now(), SystemTime::now()));
        RefreshOutcome::Completed { loaded, failed }
    }

    /// Kick off a non-forced refresh in the background, e.g. after a lookup
    /// for an unknown kid.
    pub fn trigger_refresh(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let RefreshOutcome::Completed { loaded, failed } = store.refresh_all(false).await {
                tracing::debug!(
                    "auth: keystore: on-demand refresh done, loaded={}, failed={}",
                    loaded,
                    failed
                );
            }
        });
    }

    /// Spawn the periodic refresh loop. Stops when `shutdown` is notified.
    pub fn start_refresh_task(self: &Arc<Self>, interval: Duration, shutdown: Arc<Notify>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let stop = shutdown.notified();
            tokio::pin!(stop);
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.refresh_all(true).await;
                    }
                    _ = &mut stop => return,
                }
            }
        });
    }

    pub fn snapshot(&self) -> Arc<KeySet> {
        self.keys.load_full()
    }

    pub fn last_refresh(&self) -> Option<SystemTime> {
        self.last_refresh.lock().map(|(_, wall)| wall)
    }
}

struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../../tests/fixtures/jwks.json");

    fn store(issuers: Vec<IssuerConfig>) -> KeyStore {
        KeyStore::new(issuers, Duration::from_millis(200), Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_load_document_and_get() {
        let ks = store(vec![]);
        let set = ks.load_document("main", FIXTURE).unwrap();
        assert_eq!(set.issuer_count(), 1);
        assert_eq!(set.key_count(), 2);
        assert!(ks.get("main", "ec-key-1").is_some());
        assert!(ks.get("main", "missing").is_none());
        assert!(ks.get("other", "ec-key-1").is_none());
    }

    #[test]
    fn test_find_uses_kid_index() {
        let ks = store(vec![]);
        ks.load_document("main", FIXTURE).unwrap();
        let (issuer, key) = ks.find("rsa-key-1", None).unwrap();
        assert_eq!(issuer, "main");
        assert_eq!(key.kid, "rsa-key-1");
        assert!(ks.find("nope", None).is_none());
    }

    #[test]
    fn test_find_prefers_claimed_issuer_for_shared_kid() {
        let ks = store(vec![]);
        ks.load_document("main", FIXTURE).unwrap();
        ks.load_document("partner", FIXTURE).unwrap();

        assert_eq!(ks.find("ec-key-1", Some("partner")).unwrap().0, "partner");
        assert_eq!(ks.find("ec-key-1", Some("main")).unwrap().0, "main");
        // Unknown or absent claim: the index owner.
        assert_eq!(ks.find("ec-key-1", Some("nobody")).unwrap().0, "main");
        assert_eq!(ks.find("ec-key-1", None).unwrap().0, "main");
    }

    #[test]
    fn test_reload_replaces_issuer_keys() {
        let ks = store(vec![]);
        ks.load_document("main", FIXTURE).unwrap();
        // Rotate: the issuer now publishes only the RSA key under a new kid.
        let mut doc: serde_json::Value = serde_json::from_str(FIXTURE).unwrap();
        let keys = doc["keys"].as_array_mut().unwrap();
        keys.retain(|k| k["kty"] == "RSA");
        keys[0]["kid"] = serde_json::json!("rsa-key-2");
        ks.load_document("main", &doc.to_string()).unwrap();
        assert!(ks.find("ec-key-1", None).is_none());
        assert!(ks.find("rsa-key-2", None).is_some());
    }

    #[test]
    fn test_bad_document_keeps_previous_keys() {
        let ks = store(vec![]);
        ks.load_document("main", FIXTURE).unwrap();
        assert!(ks.load_document("main", "garbage").is_err());
        assert_eq!(ks.snapshot().key_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_absorbed() {
        // Nothing listens on port 9; the fetch fails and the store stays empty.
        let ks = store(vec![IssuerConfig {
            name: "main".into(),
            jwks_uri: "http://127.0.0.1:9/jwks.json".into(),
        }]);
        let outcome = ks.refresh_all(true).await;
        assert_eq!(outcome, RefreshOutcome::Completed { loaded: 0, failed: 1 });
        assert_eq!(ks.snapshot().key_count(), 0);
        assert!(ks.last_refresh().is_some());
    }

    #[tokio::test]
    async fn test_non_forced_refresh_skipped_within_gap() {
        let ks = store(vec![]);
        assert!(matches!(
            ks.refresh_all(true).await,
            RefreshOutcome::Completed { .. }
        ));
        assert_eq!(ks.refresh_all(false).await, RefreshOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_overlapping_refresh_skipped() {
        let ks = store(vec![]);
        ks.refreshing.store(true, Ordering::Release);
        assert_eq!(ks.refresh_all(true).await, RefreshOutcome::Skipped);
    }
}
