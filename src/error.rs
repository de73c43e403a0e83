use http::StatusCode;
use std::fmt;

/// Why a bearer token was refused. Every variant maps to a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Malformed(String),
    KeyNotFound(String),
    SignatureInvalid,
    Expired,
}

impl AuthError {
    /// Stable machine-readable code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "TOKEN_MISSING",
            AuthError::Malformed(_) => "TOKEN_MALFORMED",
            AuthError::KeyNotFound(_) => "KEY_NOT_FOUND",
            AuthError::SignatureInvalid => "SIGNATURE_INVALID",
            AuthError::Expired => "TOKEN_EXPIRED",
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Missing => write!(f, "bearer token missing"),
            AuthError::Malformed(msg) => write!(f, "malformed token: {}", msg),
            AuthError::KeyNotFound(kid) => write!(f, "no verification key for kid '{}'", kid),
            AuthError::SignatureInvalid => write!(f, "token signature invalid"),
            AuthError::Expired => write!(f, "token expired"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Failures of collaborators the gateway depends on (JWKS endpoints, the
/// shared store). Never surfaced to clients directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraError {
    JwksFetch { issuer: String, reason: String },
    StoreUnavailable(String),
    Timeout(&'static str),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfraError::JwksFetch { issuer, reason } => {
                write!(f, "jwks fetch failed for issuer '{}': {}", issuer, reason)
            }
            InfraError::StoreUnavailable(msg) => write!(f, "shared store unavailable: {}", msg),
            InfraError::Timeout(op) => write!(f, "{} timed out", op),
        }
    }
}

impl std::error::Error for InfraError {}

impl From<redis::RedisError> for InfraError {
    fn from(e: redis::RedisError) -> Self {
        InfraError::StoreUnavailable(e.to_string())
    }
}

/// Everything a request can end with other than an upstream response.
#[derive(Debug)]
pub enum GatewayError {
    Auth(AuthError),
    Infrastructure(InfraError),
    RateLimited { retry_after_secs: u64 },
    NoRouteMatch,
    UpstreamTimeout,
    UpstreamConnect(String),
    Config(String),
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(e) => e.code(),
            GatewayError::Infrastructure(_) => "SERVICE_UNAVAILABLE",
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::NoRouteMatch => "ROUTE_NOT_FOUND",
            GatewayError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamConnect(_) => "UPSTREAM_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Auth(e) => write!(f, "authentication failed: {}", e),
            GatewayError::Infrastructure(e) => write!(f, "infrastructure error: {}", e),
            GatewayError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        GatewayError::Auth(e)
    }
}

impl From<InfraError> for GatewayError {
    fn from(e: InfraError) -> Self {
        GatewayError::Infrastructure(e)
    }
}
