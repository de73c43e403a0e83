use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::gray::{GrayRouter, StickyStore};
use crate::kv::KvClient;
use crate::metrics::Metrics;
use crate::proxy::filter::{build_filters, FilterChain};
use crate::proxy::{build_upstream_client, UpstreamClient};
use crate::ratelimit::{DistributedLimiter, LocalBuckets, RateLimiter};
use crate::routing::RouteTable;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Sub-states, one per cohesive domain boundary.
// Consumers should depend on the narrowest sub-state they need.
// ---------------------------------------------------------------------------

/// Components the filters are built from, kept so the admin API and the
/// background tasks can reach them.
#[derive(Clone)]
pub struct Components {
    pub authenticator: Option<Arc<Authenticator>>,
    pub gray: Arc<GrayRouter>,
    pub local_buckets: Arc<LocalBuckets>,
    pub distributed: Arc<DistributedLimiter>,
    pub kv: Option<Arc<KvClient>>,
}

impl Components {
    fn build(config: &GatewayConfig) -> Result<Self> {
        let kv = KvClient::from_config(&config.redis)?.map(Arc::new);

        let authenticator = if config.auth.enabled {
            Some(Arc::new(Authenticator::new(&config.auth)?))
        } else {
            info!("auth: disabled");
            None
        };

        let rl = &config.rate_limit;
        let local_buckets = Arc::new(LocalBuckets::new(Duration::from_secs(rl.idle_ttl_secs)));
        let distributed = Arc::new(match &kv {
            Some(kv) => DistributedLimiter::redis(Arc::clone(kv), rl.key_prefix.clone()),
            None => DistributedLimiter::memory(rl.key_prefix.clone()),
        });
        info!(
            "ratelimit: shared store ready, backend={}, distributed={}",
            distributed.backend_name(),
            rl.distributed
        );

        let gray_cfg = &config.gray;
        let mut sticky = StickyStore::new(Duration::from_secs(gray_cfg.sticky_ttl_secs));
        match (&kv, gray_cfg.sticky_remote) {
            (Some(kv), true) => {
                sticky = sticky.with_remote(Arc::clone(kv), gray_cfg.sticky_key_prefix.clone());
            }
            (None, true) => {
                tracing::warn!("gray: sticky_remote requested without redis, using local store only");
            }
            _ => {}
        }
        let gray = Arc::new(GrayRouter::new(gray_cfg, Arc::new(sticky)));

        Ok(Self {
            authenticator,
            gray,
            local_buckets,
            distributed,
            kv,
        })
    }
}

// ---------------------------------------------------------------------------
// GatewayState: root aggregate composed of sub-states.
// ---------------------------------------------------------------------------

/// Shared gateway state, cheaply cloneable.
///
/// The route table and the filter chain are built once. Reloadable pieces
/// (gray services) swap their own internals; mutations are serialized
/// through `config_mu`.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub components: Components,
    routes: Arc<RouteTable>,
    pipeline: Arc<FilterChain>,
    http_client: UpstreamClient,
    config_path: Option<Arc<PathBuf>>,
    config_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let metrics = Metrics::install();
        let components = Components::build(&config)?;

        let rate_limiter = RateLimiter::new(
            &config.rate_limit,
            Arc::clone(&components.local_buckets),
            Arc::clone(&components.distributed),
        );
        let pipeline = build_filters(
            &config,
            components.authenticator.clone(),
            rate_limiter,
            Arc::clone(&components.gray),
        )?;

        let routes = RouteTable::new(&config.routes);
        metrics::gauge!("gateway_config_routes_total").set(routes.route_count() as f64);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            components,
            routes: Arc::new(routes),
            pipeline: Arc::new(pipeline),
            http_client: build_upstream_client(UPSTREAM_CONNECT_TIMEOUT),
            config_path: config_path.map(Arc::new),
            config_mu: Arc::new(Mutex::new(())),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pipeline(&self) -> &FilterChain {
        &self.pipeline
    }

    pub fn http_client(&self) -> &UpstreamClient {
        &self.http_client
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref().map(PathBuf::as_path)
    }

    /// Re-read the config file and swap in its gray services. Everything
    /// else in the file is ignored until restart.
    pub async fn reload_gray(&self) -> Result<usize> {
        let _guard = self.config_mu.lock().await;
        let path = self
            .config_path()
            .ok_or_else(|| anyhow::anyhow!("gateway was started without a config file"))?;

        let fresh = match GatewayConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                metrics::counter!("gateway_config_reloads_total", "result" => "error").increment(1);
                return Err(e);
            }
        };

        self.components.gray.refresh(&fresh.gray.services);
        let count = fresh.gray.services.len();

        let mut current = (**self.config.load()).clone();
        current.gray.services = fresh.gray.services;
        self.config.store(Arc::new(current));

        metrics::counter!("gateway_config_reloads_total", "result" => "success").increment(1);
        info!("config: gray services reloaded, services={}", count);
        Ok(count)
    }
}
