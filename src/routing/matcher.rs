use crate::config::RouteConfig;
use crate::routing::pattern;
use globset::GlobMatcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A route compiled once at config load; shared by every request it matches.
#[derive(Debug)]
pub struct CompiledRoute {
    pub name: String,
    pub pattern: String,
    pub service_id: String,
    pub upstream: String,
    pub version_upstreams: HashMap<String, String>,
    pub timeout: Duration,
    matcher: GlobMatcher,
    specificity: usize,
}

impl CompiledRoute {
    pub fn compile(cfg: &RouteConfig) -> Result<Self, globset::Error> {
        Ok(Self {
            name: cfg.name.clone(),
            pattern: cfg.pattern.clone(),
            service_id: cfg.service_id.clone(),
            upstream: cfg.upstream.trim_end_matches('/').to_string(),
            version_upstreams: cfg
                .version_upstreams
                .iter()
                .map(|(v, u)| (v.clone(), u.trim_end_matches('/').to_string()))
                .collect(),
            timeout: Duration::from_secs_f64(cfg.timeout_secs),
            matcher: pattern::compile(&cfg.pattern)?,
            specificity: pattern::specificity(&cfg.pattern),
        })
    }

    /// Base URL for a resolved gray version, falling back to the route's
    /// primary upstream.
    pub fn upstream_for(&self, version: Option<&str>) -> &str {
        version
            .and_then(|v| self.version_upstreams.get(v))
            .map(String::as_str)
            .unwrap_or(&self.upstream)
    }
}

/// Path-glob route table. The most specific matching pattern wins; ties go
/// to configuration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Sorted by specificity (desc), then configuration order.
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Build from route configs. Routes with invalid patterns are skipped
    /// and logged.
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<(usize, Arc<CompiledRoute>)> = Vec::with_capacity(configs.len());
        for (i, cfg) in configs.iter().enumerate() {
            match CompiledRoute::compile(cfg) {
                Ok(r) => routes.push((i, Arc::new(r))),
                Err(e) => tracing::warn!(
                    "routing: invalid route pattern, name={}, pattern={}, error={}",
                    cfg.name,
                    cfg.pattern,
                    e
                ),
            }
        }
        routes.sort_by(|(ia, a), (ib, b)| b.specificity.cmp(&a.specificity).then(ia.cmp(ib)));

        tracing::info!("routing: compiled route table, count={}", routes.len());

        Self {
            routes: routes.into_iter().map(|(_, r)| r).collect(),
        }
    }

    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .iter()
            .find(|r| r.matcher.is_match(path))
            .cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
