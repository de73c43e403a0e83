use crate::auth::Claims;
use crate::error::GatewayError;
use crate::ratelimit::Decision;
use crate::routing::{pattern, CompiledRoute};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Structured error response: `status`, `title`, machine-readable `code`,
/// `detail`, plus `error`/`message` aliases for clients that read those.
pub fn problem_response(status: StatusCode, code: &str, detail: &str) -> hyper::Response<BoxBody> {
    let body = serde_json::json!({
        "status": status.as_u16(),
        "title": status.canonical_reason().unwrap_or("Error"),
        "code": code,
        "detail": detail,
        "error": code.to_ascii_lowercase(),
        "message": detail,
    });
    let mut resp = hyper::Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Problem response for a gateway-side outcome.
pub fn problem_for(err: &GatewayError) -> hyper::Response<BoxBody> {
    let detail = match err {
        GatewayError::Auth(e) => e.to_string(),
        other => other.to_string(),
    };
    problem_response(err.status(), err.code(), &detail)
}

/// Client address: first `X-Forwarded-For` element, then `X-Real-IP`, then
/// the socket peer. Must be read from the headers as received, before the
/// gateway appends its own forwarding headers.
pub fn resolve_client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<IpAddr>().ok())
    };
    from_header("x-forwarded-for")
        .or_else(|| from_header("x-real-ip"))
        .unwrap_or_else(|| peer_addr.ip())
}

/// Per-request state threaded through the filter chain. `headers` is the
/// outgoing header set; filters mutate it before it is sent upstream.
pub struct RequestContext {
    pub method: String,
    pub uri_path: String,
    pub query: Option<String>,
    pub host: String,
    pub headers: HeaderMap,
    pub client_ip: IpAddr,
    pub route_name: String,
    pub service_id: String,
    pub upstream_addr: String,
    pub claims: Option<Arc<Claims>>,
    pub rate_limit: Option<Decision>,
    pub gray_version: Option<String>,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    pub route: Option<Arc<CompiledRoute>>,
}

impl RequestContext {
    /// `uri_path` is stored in canonical form (see
    /// [`normalize_path`](crate::routing::pattern::normalize_path)); every
    /// filter and the upstream request see that form only.
    pub fn new(method: String, uri_path: String, headers: HeaderMap, client_ip: IpAddr) -> Self {
        let canonical = match pattern::normalize_path(&uri_path) {
            Cow::Owned(p) => Some(p),
            Cow::Borrowed(_) => None,
        };
        let uri_path = canonical.unwrap_or(uri_path);
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self {
            method,
            uri_path,
            query: None,
            host,
            headers,
            client_ip,
            route_name: String::new(),
            service_id: String::new(),
            upstream_addr: String::new(),
            claims: None,
            rate_limit: None,
            gray_version: None,
            start: Instant::now(),
            upstream_start: None,
            route: None,
        }
    }

    pub fn with_query(mut self, query: Option<&str>) -> Self {
        self.query = query.filter(|q| !q.is_empty()).map(str::to_string);
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_deref().map(|c| c.subject.as_str())
    }

    fn version_label(&self) -> String {
        self.gray_version.clone().unwrap_or_default()
    }

    /// Build a problem response and record it as the final outcome of the
    /// request.
    pub fn error_response(
        &self,
        status: StatusCode,
        code: &str,
        detail: &str,
    ) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());
        problem_response(status, code, detail)
    }

    /// `error_response` for a typed gateway error.
    pub fn reject(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        self.finalize_metrics(err.status().as_u16());
        problem_for(err)
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_name.clone(),
            "service" => self.service_id.clone(),
            "version" => self.version_label(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_name.clone(),
            "service" => self.service_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "route" => self.route_name.clone(),
                "upstream" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        if !self.route_name.is_empty() {
            metrics::gauge!(
                "gateway_http_requests_in_flight",
                "route" => self.route_name.clone(),
            )
            .decrement(1.0);
        }
    }
}
