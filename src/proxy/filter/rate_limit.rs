use super::FilterResult;
use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::proxy::context::{problem_for, BoxBody, RequestContext};
use crate::ratelimit::{Decision, Limit, RateLimiter};
use crate::routing::pattern;
use globset::GlobMatcher;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::net::IpAddr;

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Per-client rate limiting. The key is the authenticated user when there
/// is one, otherwise the client address, so this filter must run after
/// authentication.
pub struct RateLimitFilter {
    limiter: RateLimiter,
    /// Most specific pattern first; ties keep configuration order.
    rules: Vec<(GlobMatcher, Limit)>,
    default: Limit,
}

impl RateLimitFilter {
    pub fn new(cfg: &RateLimitConfig, limiter: RateLimiter) -> anyhow::Result<Self> {
        let mut ranked = Vec::with_capacity(cfg.rules.len());
        for (i, rule) in cfg.rules.iter().enumerate() {
            let matcher = pattern::compile(&rule.pattern).map_err(|e| {
                anyhow::anyhow!("rate limit rule '{}': invalid pattern: {}", rule.name, e)
            })?;
            ranked.push((pattern::specificity(&rule.pattern), i, matcher, Limit::from_rule(rule)));
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(Self {
            limiter,
            rules: ranked.into_iter().map(|(_, _, m, l)| (m, l)).collect(),
            default: Limit::default_for(cfg),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The most specific rule matching `path`, or the defaults.
    pub fn limit_for(&self, path: &str) -> &Limit {
        self.rules
            .iter()
            .find(|(m, _)| m.is_match(path))
            .map(|(_, l)| l)
            .unwrap_or(&self.default)
    }

    /// Admission decision for one request. The caller is identified by the
    /// authenticated user when known, else by client address.
    pub async fn admit(&self, path: &str, user_id: Option<&str>, client_ip: IpAddr) -> (&Limit, Decision) {
        let limit = self.limit_for(path);
        let key = match user_id {
            Some(user) => format!("{}:user:{}", limit.name, user),
            None => format!("{}:ip:{}", limit.name, client_ip),
        };
        (limit, self.limiter.check(limit, &key).await)
    }

    pub(super) async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        let (limit, decision) = self
            .admit(&ctx.uri_path, ctx.user_id(), ctx.client_ip)
            .await;
        ctx.rate_limit = Some(decision);

        if decision.allowed {
            metrics::counter!("gateway_rate_limit_allowed_total", "rule" => limit.name.clone())
                .increment(1);
            return FilterResult::Continue;
        }

        tracing::debug!(
            "filter: rate_limit: rejected, rule={}, client={}, retry_after={}",
            limit.name,
            ctx.user_id().map(str::to_string).unwrap_or_else(|| ctx.client_ip.to_string()),
            decision.retry_after_secs
        );
        metrics::counter!("gateway_rate_limit_rejected_total", "rule" => limit.name.clone())
            .increment(1);

        ctx.finalize_metrics(StatusCode::TOO_MANY_REQUESTS.as_u16());
        let mut resp = problem_for(&GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs.max(1),
        });
        let headers = resp.headers_mut();
        apply_headers(headers, &decision);
        headers.insert(RETRY_AFTER, number(decision.retry_after_secs.max(1)));
        FilterResult::Reject(resp)
    }

    pub(super) fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        if let Some(decision) = &ctx.rate_limit {
            apply_headers(resp.headers_mut(), decision);
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, d: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), number(d.limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), number(d.remaining));
    headers.insert(X_RATELIMIT_RESET.clone(), number(d.reset_after_secs));
}

fn number(n: u64) -> HeaderValue {
    let mut buf = itoa::Buffer::new();
    HeaderValue::from_str(buf.format(n)).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitAlgorithm, RateLimitRule};
    use crate::ratelimit::{DistributedLimiter, LocalBuckets};
    use std::sync::Arc;
    use std::time::Duration;

    fn rule(name: &str, pattern: &str, rate: f64, capacity: u64) -> RateLimitRule {
        RateLimitRule {
            name: name.into(),
            pattern: pattern.into(),
            rate,
            capacity,
            algorithm: LimitAlgorithm::TokenBucket,
            window_secs: None,
            limit: None,
        }
    }

    fn filter(rules: Vec<RateLimitRule>) -> RateLimitFilter {
        let cfg = RateLimitConfig {
            rules,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(
            &cfg,
            Arc::new(LocalBuckets::new(Duration::from_secs(300))),
            Arc::new(DistributedLimiter::memory("t:")),
        );
        RateLimitFilter::new(&cfg, limiter).unwrap()
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let f = filter(vec![
            rule("api", "/api/**", 100.0, 100),
            rule("orders", "/api/orders/**", 10.0, 20),
            rule("orders-dup", "/api/orders/**", 1.0, 1),
        ]);
        assert_eq!(f.limit_for("/api/orders/42").name, "orders");
        assert_eq!(f.limit_for("/api/users").name, "api");
        assert_eq!(f.limit_for("/health").name, "default");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let cfg = RateLimitConfig {
            rules: vec![rule("bad", "/api/[", 1.0, 1)],
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(
            &cfg,
            Arc::new(LocalBuckets::new(Duration::from_secs(300))),
            Arc::new(DistributedLimiter::memory("t:")),
        );
        assert!(RateLimitFilter::new(&cfg, limiter).is_err());
    }

    #[tokio::test]
    async fn test_admit_keys_by_user_then_ip() {
        let f = filter(vec![rule("tiny", "/tiny/**", 0.001, 1)]);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();

        let admit = |user: Option<&'static str>| {
            let f = &f;
            async move { f.admit("/tiny/a", user, ip).await.1.allowed }
        };

        let (limit, d) = f.admit("/tiny/a", Some("alice"), ip).await;
        assert_eq!(limit.name, "tiny");
        assert!(d.allowed);
        assert!(!admit(Some("alice")).await);

        // Same address, different user: separate bucket.
        assert!(admit(Some("bob")).await);
        // Anonymous caller from the same address: keyed by ip.
        assert!(admit(None).await);
        assert!(!admit(None).await);
    }

    #[test]
    fn test_header_values() {
        let mut h = HeaderMap::new();
        apply_headers(
            &mut h,
            &Decision {
                allowed: true,
                limit: 20,
                remaining: 7,
                reset_after_secs: 2,
                retry_after_secs: 0,
            },
        );
        assert_eq!(h.get("x-ratelimit-limit").unwrap(), "20");
        assert_eq!(h.get("x-ratelimit-remaining").unwrap(), "7");
        assert_eq!(h.get("x-ratelimit-reset").unwrap(), "2");
    }
}
