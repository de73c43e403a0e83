use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Later calls return the handle of the first install.
    pub fn install() -> Self {
        let handle = HANDLE.get_or_init(|| {
            let handle = build_recorder_handle();
            describe_all();
            handle
        });
        Self {
            handle: handle.clone(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn build_recorder_handle() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let builder = match builder.set_buckets_for_metric(
        Matcher::Suffix("_duration_seconds".to_string()),
        LATENCY_BUCKETS,
    ) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("metrics: latency buckets rejected, error={}", e);
            PrometheusBuilder::new()
        }
    };

    // A recorder may already be installed (another test harness, an
    // embedding application); render from a detached one in that case.
    let recorder = builder.build_recorder();
    let handle = recorder.handle();
    if let Err(e) = metrics::set_global_recorder(recorder) {
        tracing::warn!("metrics: global recorder already set, error={}", e);
    }
    handle
}

fn describe_all() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Upstream request duration (time spent waiting for upstream)"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );

    // authentication
    describe_counter!(
        "gateway_auth_total",
        Unit::Count,
        "Token verifications by result"
    );
    describe_counter!(
        "gateway_jwks_refresh_total",
        Unit::Count,
        "JWKS refresh attempts per issuer by result"
    );

    // rate limiting
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_allowed_total",
        Unit::Count,
        "Total requests allowed by rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_degraded_total",
        Unit::Count,
        "Rate limit decisions taken by the degraded local fallback"
    );

    // gray release
    describe_counter!(
        "gateway_gray_resolved_total",
        Unit::Count,
        "Version resolutions by decision source"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
    describe_counter!(
        "gateway_config_reloads_total",
        Unit::Count,
        "Config reload events"
    );
}
