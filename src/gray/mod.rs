pub mod rules;
pub mod selector;
pub mod sticky;

pub use selector::{consistent_hash, WeightedSelector};
pub use sticky::StickyStore;

use crate::config::{GrayConfig, ServiceVersionConfig};
use arc_swap::ArcSwap;
use http::HeaderMap;
use rules::{user_bucket, CompiledRule};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a resolved version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    Override,
    Sticky,
    Rule,
    Weighted,
    Default,
}

impl VersionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionSource::Override => "override",
            VersionSource::Sticky => "sticky",
            VersionSource::Rule => "rule",
            VersionSource::Weighted => "weighted",
            VersionSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: String,
    pub source: VersionSource,
}

#[derive(Debug)]
pub struct CompiledService {
    pub service_id: String,
    pub default_version: Option<String>,
    pub selector: WeightedSelector,
    pub rules: Vec<CompiledRule>,
}

impl CompiledService {
    fn compile(cfg: &ServiceVersionConfig) -> Self {
        let rules = cfg
            .rules
            .iter()
            .filter_map(|r| match CompiledRule::compile(r) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(
                        "gray: rule skipped, service={}, error={}",
                        cfg.service_id,
                        e
                    );
                    None
                }
            })
            .collect();
        Self {
            service_id: cfg.service_id.clone(),
            default_version: cfg.default_version.clone().filter(|v| !v.is_empty()),
            selector: WeightedSelector::new(&cfg.versions),
            rules,
        }
    }
}

/// Resolves the backend version for each request.
///
/// Order: explicit override (header, cookie, query parameter), sticky
/// assignment, rules in configured order, weighted selection, then the
/// service or global default. Rule and weighted outcomes for known users are
/// recorded as sticky assignments, so a weight change never moves a user
/// who is already assigned.
pub struct GrayRouter {
    services: ArcSwap<HashMap<String, Arc<CompiledService>>>,
    sticky: Arc<StickyStore>,
    default_version: String,
    version_header: String,
    cookie_name: String,
    query_param: String,
}

impl GrayRouter {
    pub fn new(cfg: &GrayConfig, sticky: Arc<StickyStore>) -> Self {
        Self {
            services: ArcSwap::from_pointee(compile_services(&cfg.services)),
            sticky,
            default_version: cfg.default_version.clone(),
            version_header: cfg.version_header.clone(),
            cookie_name: cfg.cookie_name.clone(),
            query_param: cfg.query_param.clone(),
        }
    }

    pub fn version_header(&self) -> &str {
        &self.version_header
    }

    pub fn service_count(&self) -> usize {
        self.services.load().len()
    }

    pub fn sticky(&self) -> &Arc<StickyStore> {
        &self.sticky
    }

    /// Rebuild selectors and rules from new service configs and swap them in
    /// atomically. Sticky assignments are kept.
    pub fn refresh(&self, services: &[ServiceVersionConfig]) {
        let compiled = compile_services(services);
        let count = compiled.len();
        self.services.store(Arc::new(compiled));
        tracing::info!("gray: services refreshed, count={}", count);
    }

    pub fn clear_sticky(&self) -> usize {
        self.sticky.clear()
    }

    /// Version explicitly requested by the caller, if any.
    pub fn explicit_override(&self, headers: &HeaderMap, query: Option<&str>) -> Option<String> {
        if let Some(v) = headers
            .get(self.version_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some(v.to_string());
        }
        if let Some(v) = cookie_value(headers, &self.cookie_name) {
            return Some(v);
        }
        query.and_then(|q| query_value(q, &self.query_param))
    }

    pub async fn resolve_version(
        &self,
        service_id: &str,
        user_id: Option<&str>,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Resolution {
        let resolution = self.resolve(service_id, user_id, headers, query).await;
        metrics::counter!("gateway_gray_resolved_total", "source" => resolution.source.as_str())
            .increment(1);
        resolution
    }

    async fn resolve(
        &self,
        service_id: &str,
        user_id: Option<&str>,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Resolution {
        if let Some(version) = self.explicit_override(headers, query) {
            return Resolution {
                version,
                source: VersionSource::Override,
            };
        }

        let Some(service) = self.services.load().get(service_id).cloned() else {
            return self.fallback(None);
        };
        let user_id = user_id.filter(|u| !u.is_empty());

        if let Some(user) = user_id {
            if let Some(version) = self.sticky.get(service_id, user).await {
                return Resolution {
                    version,
                    source: VersionSource::Sticky,
                };
            }
        }

        let bucket = user_bucket(user_id);
        let picked = service
            .rules
            .iter()
            .find(|r| r.matches(user_id, headers, bucket))
            .map(|r| (r.target_version.clone(), VersionSource::Rule))
            .or_else(|| {
                service
                    .selector
                    .select(bucket)
                    .map(|v| (v.to_string(), VersionSource::Weighted))
            });

        match picked {
            Some((version, source)) => {
                if let Some(user) = user_id {
                    self.sticky.put(service_id, user, &version).await;
                }
                Resolution { version, source }
            }
            None => self.fallback(Some(&service)),
        }
    }

    fn fallback(&self, service: Option<&CompiledService>) -> Resolution {
        let version = service
            .and_then(|s| s.default_version.clone())
            .unwrap_or_else(|| self.default_version.clone());
        Resolution {
            version,
            source: VersionSource::Default,
        }
    }
}

fn compile_services(services: &[ServiceVersionConfig]) -> HashMap<String, Arc<CompiledService>> {
    services
        .iter()
        .map(|s| (s.service_id.clone(), Arc::new(CompiledService::compile(s))))
        .collect()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
}

fn query_value(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
}
