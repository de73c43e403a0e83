pub mod auth;
pub mod gray;
pub mod rate_limit;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::gray::GrayRouter;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::ratelimit::RateLimiter;
use std::sync::Arc;

pub use auth::AuthFilter;
pub use gray::GrayFilter;
pub use rate_limit::RateLimitFilter;

/// Result of a filter's on_request phase.
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Enum-based filter with static dispatch.
///
/// Each variant holds the state it needs. Filters are built once at startup,
/// NOT per-request.
pub enum Filter {
    Auth(AuthFilter),
    RateLimit(RateLimitFilter),
    GrayRelease(GrayFilter),
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Auth(_) => "auth",
            Filter::RateLimit(_) => "rate_limit",
            Filter::GrayRelease(_) => "gray_release",
        }
    }

    /// Request phase, runs before the upstream call.
    /// Return `FilterResult::Reject` to short-circuit.
    pub async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        match self {
            Filter::Auth(f) => f.on_request(ctx).await,
            Filter::RateLimit(f) => f.on_request(ctx).await,
            Filter::GrayRelease(f) => f.on_request(ctx).await,
        }
    }

    /// Response phase, runs after the upstream response, before sending to
    /// the client.
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        match self {
            Filter::Auth(_) => {}
            Filter::RateLimit(f) => f.on_response(ctx, resp),
            Filter::GrayRelease(f) => f.on_response(ctx, resp),
        }
    }
}

/// Filters in execution order. Requests run front to back and stop at the
/// first rejection; responses run back to front.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(Filter::name).collect()
    }

    pub fn auth(&self) -> Option<&AuthFilter> {
        self.filters.iter().find_map(|f| match f {
            Filter::Auth(a) => Some(a),
            _ => None,
        })
    }

    pub fn rate_limit(&self) -> Option<&RateLimitFilter> {
        self.filters.iter().find_map(|f| match f {
            Filter::RateLimit(r) => Some(r),
            _ => None,
        })
    }

    pub async fn on_request(&self, ctx: &mut RequestContext) -> Option<hyper::Response<BoxBody>> {
        for filter in &self.filters {
            if let FilterResult::Reject(resp) = filter.on_request(ctx).await {
                return Some(resp);
            }
        }
        None
    }

    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        for filter in self.filters.iter().rev() {
            filter.on_response(ctx, resp);
        }
    }
}

/// Build the chain once at startup.
///
/// Order matters and is fixed:
/// 1. Auth        (identity decides the rate-limit key)
/// 2. RateLimit   (reject early, save upstream resources)
/// 3. GrayRelease (version for the admitted request)
///
/// Disabled filters are left out. Auth is also left out when no
/// authenticator was built.
pub fn build_filters(
    cfg: &GatewayConfig,
    authenticator: Option<Arc<Authenticator>>,
    rate_limiter: RateLimiter,
    gray: Arc<GrayRouter>,
) -> anyhow::Result<FilterChain> {
    let mut filters = Vec::with_capacity(3);

    if cfg.auth.enabled {
        if let Some(a) = authenticator {
            filters.push(Filter::Auth(AuthFilter::new(&cfg.auth, a)?));
        }
    }
    if cfg.rate_limit.enabled {
        filters.push(Filter::RateLimit(RateLimitFilter::new(
            &cfg.rate_limit,
            rate_limiter,
        )?));
    }
    if cfg.gray.enabled {
        filters.push(Filter::GrayRelease(GrayFilter::new(gray)?));
    }

    let chain = FilterChain::new(filters);
    tracing::info!("filter: chain built, filters={:?}", chain.names());
    Ok(chain)
}
