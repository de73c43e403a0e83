use super::GatewayState;
use crate::auth::RefreshOutcome;
use crate::proxy::context::{full_body, problem_response, BoxBody};
use crate::proxy::filter::auth::bearer_token;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/health" | "/healthz") => json(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),

        (&Method::GET, "/ready" | "/readyz") => ready(&state),

        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(full_body(state.metrics.render()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            resp
        }

        (&Method::POST, "/keys/refresh") => refresh_keys(&state).await,

        (&Method::POST, "/auth/invalidate") => invalidate_token(req.headers(), &state),

        (&Method::DELETE, "/auth/cache") => match &state.components.authenticator {
            Some(auth) => json(
                StatusCode::OK,
                serde_json::json!({ "flushed": auth.flush_cache() }).to_string(),
            ),
            None => problem_response(StatusCode::NOT_FOUND, "AUTH_DISABLED", "authentication is disabled"),
        },

        (&Method::POST, "/gray/reload") => match state.reload_gray().await {
            Ok(count) => json(
                StatusCode::OK,
                serde_json::json!({ "reloaded": true, "services": count }).to_string(),
            ),
            Err(e) => {
                tracing::warn!("admin: gray reload failed, error={}", e);
                problem_response(StatusCode::BAD_REQUEST, "RELOAD_FAILED", &e.to_string())
            }
        },

        (&Method::DELETE, "/gray/sticky") => {
            let cleared = state.components.gray.clear_sticky();
            tracing::info!("admin: sticky assignments cleared, count={}", cleared);
            json(
                StatusCode::OK,
                serde_json::json!({ "cleared": cleared }).to_string(),
            )
        }

        _ => problem_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown admin endpoint"),
    };
    Ok(resp)
}

fn json(status: StatusCode, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn ready(state: &GatewayState) -> Response<BoxBody> {
    let c = &state.components;
    let (issuers, keys, last_refresh) = match &c.authenticator {
        Some(a) => {
            let snapshot = a.keys().snapshot();
            let last = a
                .keys()
                .last_refresh()
                .map(|t| humantime::format_rfc3339_seconds(t).to_string());
            (snapshot.issuer_count(), snapshot.key_count(), last)
        }
        None => (0, 0, None),
    };

    // Without any verification key, every protected request would fail.
    let auth_ready = c.authenticator.is_none() || keys > 0;
    let status = if auth_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if auth_ready { "ready" } else { "not_ready" },
        "routes": state.routes().route_count(),
        "filters": state.pipeline().names(),
        "auth": {
            "issuers": issuers,
            "keys": keys,
            "last_refresh": last_refresh,
        },
        "rate_limit": {
            "backend": c.distributed.backend_name(),
            "degraded": state.pipeline().rate_limit().map(|r| r.limiter().is_degraded()),
            "local_buckets": c.local_buckets.len(),
        },
        "gray": {
            "services": c.gray.service_count(),
            "sticky": c.gray.sticky().len(),
        },
    });
    json(status, body.to_string())
}

async fn refresh_keys(state: &GatewayState) -> Response<BoxBody> {
    let Some(auth) = &state.components.authenticator else {
        return problem_response(StatusCode::NOT_FOUND, "AUTH_DISABLED", "authentication is disabled");
    };
    match auth.keys().refresh_all(true).await {
        RefreshOutcome::Skipped => json(
            StatusCode::CONFLICT,
            r#"{"refreshed":false,"reason":"refresh already in progress"}"#.to_string(),
        ),
        RefreshOutcome::Completed { loaded, failed } => json(
            StatusCode::OK,
            serde_json::json!({ "refreshed": true, "loaded": loaded, "failed": failed }).to_string(),
        ),
    }
}

fn invalidate_token(headers: &HeaderMap, state: &GatewayState) -> Response<BoxBody> {
    let Some(auth) = &state.components.authenticator else {
        return problem_response(StatusCode::NOT_FOUND, "AUTH_DISABLED", "authentication is disabled");
    };
    match bearer_token(headers) {
        Some(t) => {
            let removed = auth.invalidate(t);
            json(
                StatusCode::OK,
                serde_json::json!({ "invalidated": removed }).to_string(),
            )
        }
        None => problem_response(
            StatusCode::BAD_REQUEST,
            "TOKEN_MISSING",
            "expected the token in 'Authorization: Bearer <token>'",
        ),
    }
}
