use super::types::*;
use super::GatewayConfig;
use std::collections::HashMap;

fn route(name: &str, pattern: &str, upstream: &str) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        pattern: pattern.into(),
        service_id: String::new(),
        upstream: upstream.into(),
        version_upstreams: HashMap::new(),
        timeout_secs: 30.0,
    }
}

fn write_tmp(name: &str, content: &str) -> std::path::PathBuf {
    let tmp = std::env::temp_dir().join(name);
    std::fs::write(&tmp, content).unwrap();
    tmp
}

#[test]
fn test_load_toml_config() {
    let toml_str = r#"
[auth]
ignore_paths = ["/public/**"]
cache_ttl_secs = 120

[auth.default_issuer]
name = "main"
jwks_uri = "http://127.0.0.1:9999/jwks.json"

[rate_limit]
default_rate = 10.0
default_capacity = 20

[[rate_limit.rules]]
name = "orders"
pattern = "/api/orders/**"
rate = 5.0
capacity = 5

[gray]
default_version = "stable"

[[gray.services]]
service_id = "orders"
versions = [{ version = "v1", weight = 80 }, { version = "v2", weight = 20 }]

[[routes]]
name = "orders"
pattern = "/api/orders/**"
upstream = "http://127.0.0.1:9000"
"#;
    let tmp = write_tmp("tollgate_test_config.toml", toml_str);
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.auth.ignore_paths, vec!["/public/**"]);
    assert_eq!(cfg.auth.cache_ttl_secs, 120);
    assert_eq!(cfg.rate_limit.rules.len(), 1);
    assert_eq!(cfg.rate_limit.rules[0].capacity, 5);
    assert_eq!(cfg.gray.default_version, "stable");
    assert_eq!(cfg.gray.services[0].versions.len(), 2);
    assert_eq!(cfg.routes[0].service_id, "orders");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "routes": [
            {"pattern": "/api/**", "upstream": "http://127.0.0.1:9000"}
        ],
        "rate_limit": {"rules": [{"pattern": "/api/**", "rate": 1, "capacity": 1}]}
    }"#;
    let tmp = write_tmp("tollgate_test_config.json", json);
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.routes.len(), 1);
    // Unnamed entries get positional names.
    assert_eq!(cfg.routes[0].name, "route-0");
    assert_eq!(cfg.routes[0].service_id, "route-0");
    assert_eq!(cfg.rate_limit.rules[0].name, "rule-0");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_missing_file_uses_defaults() {
    let path = std::env::temp_dir().join("tollgate_does_not_exist.toml");
    let cfg = GatewayConfig::load(&path).unwrap();
    assert!(cfg.routes.is_empty());
    assert_eq!(cfg.rate_limit.default_rate, 100.0);
}

#[test]
fn test_unsupported_format() {
    let tmp = write_tmp("tollgate_test.yml", "key: value");
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_valid_config() {
    let cfg = GatewayConfig {
        routes: vec![route("r1", "/api/**", "http://127.0.0.1:9000")],
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_empty_pattern_fails() {
    let cfg = GatewayConfig {
        routes: vec![route("bad", "", "http://127.0.0.1:9000")],
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_missing_upstream_fails() {
    let cfg = GatewayConfig {
        routes: vec![route("bad", "/x", "")],
        ..GatewayConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_rate_rule_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.rules.push(RateLimitRule {
        name: "zero".into(),
        pattern: "/x".into(),
        rate: 0.0,
        capacity: 10,
        algorithm: LimitAlgorithm::TokenBucket,
        window_secs: None,
        limit: None,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_sliding_window_requires_limit() {
    let mut cfg = GatewayConfig::default();
    cfg.rate_limit.rules.push(RateLimitRule {
        name: "sw".into(),
        pattern: "/x".into(),
        rate: 1.0,
        capacity: 1,
        algorithm: LimitAlgorithm::SlidingWindow,
        window_secs: Some(60),
        limit: None,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_total_weight_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.gray.services.push(ServiceVersionConfig {
        service_id: "svc".into(),
        default_version: None,
        versions: vec![
            VersionWeight { version: "v1".into(), weight: 0 },
            VersionWeight { version: "v2".into(), weight: 0 },
        ],
        rules: vec![],
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_percentage_out_of_range_fails() {
    let mut cfg = GatewayConfig::default();
    cfg.gray.services.push(ServiceVersionConfig {
        service_id: "svc".into(),
        default_version: None,
        versions: vec![VersionWeight { version: "v1".into(), weight: 1 }],
        rules: vec![GrayRuleConfig {
            match_type: MatchType::Percentage,
            match_key: String::new(),
            match_value: "150".into(),
            target_version: "v2".into(),
        }],
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_header_rule_needs_key() {
    let mut cfg = GatewayConfig::default();
    cfg.gray.services.push(ServiceVersionConfig {
        service_id: "svc".into(),
        default_version: None,
        versions: vec![],
        rules: vec![GrayRuleConfig {
            match_type: MatchType::Header,
            match_key: String::new(),
            match_value: "1".into(),
            target_version: "v2".into(),
        }],
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_deserialize_toml_defaults() {
    let toml_str = r#"
[redis]
url = "redis://127.0.0.1:6379"
"#;
    let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.redis.url.as_deref(), Some("redis://127.0.0.1:6379"));
    assert_eq!(cfg.redis.timeout_ms, 50);
    assert_eq!(cfg.gray.version_header, "X-Gray-Version");
    assert_eq!(cfg.gray.cookie_name, "gray-version");
    assert_eq!(cfg.gray.query_param, "grayVersion");
    assert_eq!(cfg.gray.sticky_ttl_secs, 3600);
    assert_eq!(cfg.rate_limit.degraded_rate_factor, 0.5);
}
