use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`; treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub gray: GrayConfig,

    /// Shared store used by the distributed limiter and sticky assignments.
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub default_issuer: Option<IssuerConfig>,

    /// Additional issuers loaded alongside the default one.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub issuers: Vec<IssuerConfig>,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Non-forced refreshes closer together than this are skipped.
    #[serde(default = "default_min_refresh_gap")]
    pub min_refresh_gap_secs: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Ant-style globs (`/public/**`) that bypass authentication.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ignore_paths: Vec<String>,

    #[serde(default)]
    pub claims: ClaimNames,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_max_verifications")]
    pub max_concurrent_verifications: usize,

    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,

    #[serde(default = "default_username_header")]
    pub username_header: String,

    #[serde(default = "default_roles_header")]
    pub roles_header: String,

    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_issuer: None,
            issuers: Vec::new(),
            refresh_interval_secs: default_refresh_interval(),
            min_refresh_gap_secs: default_min_refresh_gap(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            ignore_paths: Vec::new(),
            claims: ClaimNames::default(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            max_concurrent_verifications: default_max_verifications(),
            user_id_header: default_user_id_header(),
            username_header: default_username_header(),
            roles_header: default_roles_header(),
            tenant_header: default_tenant_header(),
        }
    }
}

impl AuthConfig {
    /// Default issuer first, then the additional ones in configured order.
    pub fn all_issuers(&self) -> Vec<IssuerConfig> {
        self.default_issuer
            .iter()
            .chain(self.issuers.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Matched against the token's `iss` claim.
    pub name: String,
    pub jwks_uri: String,
}

/// Claim names used to build identity from a verified token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimNames {
    #[serde(default = "default_subject_claim")]
    pub subject: String,
    #[serde(default = "default_username_claim")]
    pub username: String,
    #[serde(default = "default_roles_claim")]
    pub roles: String,
    #[serde(default = "default_tenant_claim")]
    pub tenant: String,
}

impl Default for ClaimNames {
    fn default() -> Self {
        Self {
            subject: default_subject_claim(),
            username: default_username_claim(),
            roles: default_roles_claim(),
            tenant: default_tenant_claim(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    1800
}

fn default_min_refresh_gap() -> u64 {
    30
}

fn default_fetch_timeout_ms() -> u64 {
    3000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_max_verifications() -> usize {
    64
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_username_header() -> String {
    "X-Username".to_string()
}

fn default_roles_header() -> String {
    "X-Roles".to_string()
}

fn default_tenant_header() -> String {
    "X-Tenant-Id".to_string()
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

fn default_username_claim() -> String {
    "username".to_string()
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

fn default_tenant_claim() -> String {
    "tenant_id".to_string()
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tokens per second for requests no rule matches.
    #[serde(default = "default_rate")]
    pub default_rate: f64,

    #[serde(default = "default_capacity")]
    pub default_capacity: u64,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<RateLimitRule>,

    #[serde(default = "default_degraded_factor")]
    pub degraded_rate_factor: f64,

    #[serde(default = "default_degraded_factor")]
    pub degraded_capacity_factor: f64,

    /// When false, the local bucket is authoritative and nothing is shared.
    #[serde(default = "default_true")]
    pub distributed: bool,

    #[serde(default = "default_rl_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rate: default_rate(),
            default_capacity: default_capacity(),
            rules: Vec::new(),
            degraded_rate_factor: default_degraded_factor(),
            degraded_capacity_factor: default_degraded_factor(),
            distributed: true,
            key_prefix: default_rl_key_prefix(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub name: String,

    /// Ant-style path glob.
    pub pattern: String,

    #[serde(default = "default_rate")]
    pub rate: f64,

    #[serde(default = "default_capacity")]
    pub capacity: u64,

    #[serde(default)]
    pub algorithm: LimitAlgorithm,

    /// Sliding-window length, required for `sliding_window`.
    #[serde(default)]
    pub window_secs: Option<u64>,

    /// Requests per window, required for `sliding_window`.
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

fn default_rate() -> f64 {
    100.0
}

fn default_capacity() -> u64 {
    200
}

fn default_degraded_factor() -> f64 {
    0.5
}

fn default_rl_key_prefix() -> String {
    "tollgate:rl:".to_string()
}

fn default_idle_ttl() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Gray release
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Used for services without their own configuration.
    #[serde(default = "default_version")]
    pub default_version: String,

    #[serde(default = "default_version_header")]
    pub version_header: String,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    #[serde(default = "default_query_param")]
    pub query_param: String,

    #[serde(default = "default_sticky_ttl")]
    pub sticky_ttl_secs: u64,

    /// Mirror sticky assignments into the shared store.
    #[serde(default)]
    pub sticky_remote: bool,

    #[serde(default = "default_sticky_prefix")]
    pub sticky_key_prefix: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceVersionConfig>,
}

impl Default for GrayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_version: default_version(),
            version_header: default_version_header(),
            cookie_name: default_cookie_name(),
            query_param: default_query_param(),
            sticky_ttl_secs: default_sticky_ttl(),
            sticky_remote: false,
            sticky_key_prefix: default_sticky_prefix(),
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceVersionConfig {
    pub service_id: String,

    /// Falls back to `gray.default_version` when absent.
    #[serde(default)]
    pub default_version: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub versions: Vec<VersionWeight>,

    /// Evaluated in order; first match wins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<GrayRuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionWeight {
    pub version: String,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrayRuleConfig {
    pub match_type: MatchType,

    /// Header name for `header` rules; unused otherwise.
    #[serde(default)]
    pub match_key: String,

    pub match_value: String,

    pub target_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    UserId,
    UserList,
    Header,
    Percentage,
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_version_header() -> String {
    "X-Gray-Version".to_string()
}

fn default_cookie_name() -> String {
    "gray-version".to_string()
}

fn default_query_param() -> String {
    "grayVersion".to_string()
}

fn default_sticky_ttl() -> u64 {
    3600
}

fn default_sticky_prefix() -> String {
    "tollgate:gray:".to_string()
}

// ---------------------------------------------------------------------------
// Shared store and routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `redis://host:port/db`. Absent means an in-process store stands in.
    #[serde(default)]
    pub url: Option<String>,

    /// Upper bound on every shared-store call on the request path.
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_redis_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_redis_timeout(),
            connect_timeout_ms: default_redis_connect_timeout(),
        }
    }
}

fn default_redis_timeout() -> u64 {
    50
}

fn default_redis_connect_timeout() -> u64 {
    500
}

/// Maps a path glob to a backend service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: String,

    /// Ant-style path glob, e.g. `/api/orders/**`.
    pub pattern: String,

    /// Key into `gray.services`. Defaults to the route name.
    #[serde(default)]
    pub service_id: String,

    /// Base URL, e.g. `http://127.0.0.1:9000`.
    pub upstream: String,

    /// Per-version base URLs; versions not listed use `upstream`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub version_upstreams: HashMap<String, String>,

    #[serde(default = "default_route_timeout")]
    pub timeout_secs: f64,
}

fn default_route_timeout() -> f64 {
    30.0
}
