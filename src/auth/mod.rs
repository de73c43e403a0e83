pub mod cache;
pub mod claims;
pub mod jwk;
pub mod keystore;

pub use cache::{ClaimsCache, Lookup};
pub use claims::Claims;
pub use keystore::{KeyStore, RefreshOutcome};

use crate::auth::jwk::KeyFamily;
use crate::config::{AuthConfig, ClaimNames};
use crate::error::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

/// Verifies bearer tokens against the key store, with a claims cache in
/// front. Signature checks run on the blocking pool, at most
/// `max_concurrent_verifications` at a time.
pub struct Authenticator {
    keys: Arc<KeyStore>,
    cache: ClaimsCache,
    claim_names: ClaimNames,
    permits: Arc<Semaphore>,
}

impl Authenticator {
    pub fn new(cfg: &AuthConfig) -> anyhow::Result<Self> {
        let keys = KeyStore::new(
            cfg.all_issuers(),
            Duration::from_millis(cfg.fetch_timeout_ms),
            Duration::from_secs(cfg.min_refresh_gap_secs),
        )?;
        Ok(Self::with_key_store(Arc::new(keys), cfg))
    }

    pub fn with_key_store(keys: Arc<KeyStore>, cfg: &AuthConfig) -> Self {
        Self {
            keys,
            cache: ClaimsCache::new(cfg.cache_capacity, cfg.cache_ttl_secs),
            claim_names: cfg.claims.clone(),
            permits: Arc::new(Semaphore::new(cfg.max_concurrent_verifications.max(1))),
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn cache(&self) -> &ClaimsCache {
        &self.cache
    }

    pub async fn authenticate(&self, raw: &str) -> Result<Arc<Claims>, AuthError> {
        let result = self.authenticate_inner(raw).await;
        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        metrics::counter!("gateway_auth_total", "result" => label).increment(1);
        result
    }

    async fn authenticate_inner(&self, raw: &str) -> Result<Arc<Claims>, AuthError> {
        if raw.is_empty() {
            return Err(AuthError::Missing);
        }
        let now = unix_now();
        match self.cache.get(raw, now) {
            Lookup::Hit(claims) => return Ok(claims),
            Lookup::Expired => return Err(AuthError::Expired),
            Lookup::Miss => {}
        }

        let header = decode_header(raw).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("token header has no kid".to_string()))?;
        let family = KeyFamily::of(header.alg).ok_or_else(|| {
            AuthError::Malformed(format!("unsupported algorithm {:?}", header.alg))
        })?;

        let claimed = claimed_issuer(raw);
        let Some((issuer, key)) = self.keys.find(&kid, claimed.as_deref()) else {
            self.keys.trigger_refresh();
            return Err(AuthError::KeyNotFound(kid));
        };
        if key.family != family || key.alg.is_some_and(|a| a != header.alg) {
            return Err(AuthError::Malformed(format!(
                "algorithm {:?} does not match key '{}'",
                header.alg, kid
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        validation.set_issuer(&[issuer.as_str()]);

        let permit = self.permits.clone().acquire_owned().await.map_err(|e| {
            tracing::warn!("auth: verifier pool closed, error={}", e);
            AuthError::SignatureInvalid
        })?;
        let token = raw.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            decode::<Map<String, Value>>(&token, &key.key, &validation)
        })
        .await
        .map_err(|e| {
            tracing::warn!("auth: verification task failed, error={}", e);
            AuthError::SignatureInvalid
        })?;

        let payload = verified.map_err(map_jwt_error)?.claims;
        let claims = Claims::from_payload(payload, &self.claim_names)?;
        if claims.is_expired_at(unix_now()) {
            return Err(AuthError::Expired);
        }

        let claims = Arc::new(claims);
        self.cache.insert(raw, claims.clone(), now);
        Ok(claims)
    }

    /// Drop a token from the claims cache. The token itself is still valid;
    /// the next request re-verifies it.
    pub fn invalidate(&self, raw: &str) -> bool {
        self.cache.invalidate(raw)
    }

    /// Empty the claims cache; every token is verified again on next use.
    pub fn flush_cache(&self) -> usize {
        let n = self.cache.clear();
        tracing::info!("auth: claims cache flushed, entries={}", n);
        n
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> AuthError {
    match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
        ErrorKind::InvalidIssuer => AuthError::Malformed("issuer mismatch".to_string()),
        _ => AuthError::Malformed(e.to_string()),
    }
}

/// The `iss` the token claims, read without verification. Only used to pick
/// among issuers that publish the same kid; verification then requires
/// `iss` to equal the issuer owning the key.
fn claimed_issuer(raw: &str) -> Option<String> {
    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
    match claims.get("iss")? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
