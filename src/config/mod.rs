pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used, allowing the gateway to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.normalize();
        config.validate()?;

        tracing::info!(
            routes = config.routes.len(),
            rate_limit_rules = config.rate_limit.rules.len(),
            gray_services = config.gray.services.len(),
            issuers = config.auth.all_issuers().len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides cover infrastructure and feature switches only.
    /// Routes, rules and gray services come from the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOLLGATE_REDIS_URL") {
            self.redis.url = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("TOLLGATE_REDIS_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.redis.timeout_ms = n;
            }
        }

        if let Ok(v) = std::env::var("TOLLGATE_AUTH_ENABLED") {
            self.auth.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TOLLGATE_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TOLLGATE_GRAY_ENABLED") {
            self.gray.enabled = v == "true" || v == "1";
        }

        if let Ok(v) = std::env::var("TOLLGATE_JWKS_URI") {
            match self.auth.default_issuer.as_mut() {
                Some(issuer) => issuer.jwks_uri = v,
                None => {
                    self.auth.default_issuer = Some(IssuerConfig {
                        name: "default".to_string(),
                        jwks_uri: v,
                    })
                }
            }
        }
    }

    /// Fill derived defaults that depend on other fields.
    fn normalize(&mut self) {
        for (i, route) in self.routes.iter_mut().enumerate() {
            if route.name.is_empty() {
                route.name = format!("route-{}", i);
            }
            if route.service_id.is_empty() {
                route.service_id = route.name.clone();
            }
        }
        for (i, rule) in self.rate_limit.rules.iter_mut().enumerate() {
            if rule.name.is_empty() {
                rule.name = format!("rule-{}", i);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            if route.pattern.is_empty() {
                anyhow::bail!("route '{}' has empty pattern", route.name);
            }
            if route.upstream.is_empty() {
                anyhow::bail!("route '{}' has no upstream", route.name);
            }
            if route.timeout_secs <= 0.0 {
                anyhow::bail!("route '{}' has non-positive timeout", route.name);
            }
        }

        let rl = &self.rate_limit;
        if rl.default_rate <= 0.0 || rl.default_capacity == 0 {
            anyhow::bail!("rate_limit: default rate and capacity must be positive");
        }
        if !(rl.degraded_rate_factor > 0.0 && rl.degraded_rate_factor <= 1.0)
            || !(rl.degraded_capacity_factor > 0.0 && rl.degraded_capacity_factor <= 1.0)
        {
            anyhow::bail!("rate_limit: degraded factors must be in (0, 1]");
        }
        for rule in &rl.rules {
            match rule.algorithm {
                LimitAlgorithm::TokenBucket => {
                    if rule.rate <= 0.0 || rule.capacity == 0 {
                        anyhow::bail!(
                            "rate_limit rule '{}': rate and capacity must be positive",
                            rule.name
                        );
                    }
                }
                LimitAlgorithm::SlidingWindow => {
                    if rule.limit.unwrap_or(0) == 0 || rule.window_secs.unwrap_or(0) == 0 {
                        anyhow::bail!(
                            "rate_limit rule '{}': sliding_window requires 'limit' and 'window_secs'",
                            rule.name
                        );
                    }
                }
            }
        }

        for svc in &self.gray.services {
            if svc.service_id.is_empty() {
                anyhow::bail!("gray service has empty service_id");
            }
            let total: u64 = svc.versions.iter().map(|v| v.weight as u64).sum();
            if !svc.versions.is_empty() && total == 0 {
                anyhow::bail!("gray service '{}' has zero total weight", svc.service_id);
            }
            for rule in &svc.rules {
                if rule.target_version.is_empty() {
                    anyhow::bail!(
                        "gray service '{}' has a rule without target_version",
                        svc.service_id
                    );
                }
                match rule.match_type {
                    MatchType::Percentage => match rule.match_value.trim().parse::<u32>() {
                        Ok(p) if p <= 100 => {}
                        _ => anyhow::bail!(
                            "gray service '{}': percentage '{}' must be an integer in 0..=100",
                            svc.service_id,
                            rule.match_value
                        ),
                    },
                    MatchType::Header => {
                        if rule.match_key.is_empty() {
                            anyhow::bail!(
                                "gray service '{}': header rule needs match_key",
                                svc.service_id
                            );
                        }
                    }
                    MatchType::UserId | MatchType::UserList => {}
                }
            }
        }

        for issuer in self.auth.all_issuers() {
            if issuer.name.is_empty() || issuer.jwks_uri.is_empty() {
                anyhow::bail!("auth: issuers need both name and jwks_uri");
            }
        }

        Ok(())
    }
}
