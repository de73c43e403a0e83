use crate::error::GatewayError;
use crate::proxy::context::{resolve_client_ip, BoxBody, RequestContext};
use crate::routing::CompiledRoute;
use crate::server::GatewayState;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH: path glob to backend service
/// 2. ON_REQUEST:  filter chain (auth, rate limit, gray release)
/// 3. UPSTREAM:    forward to the version-specific backend
/// 4. ON_RESPONSE: filter chain in reverse (rate-limit and version headers)
/// 5. LOG:         finalize metrics, access log
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let mut headers = parts.headers;

    // Client address comes from the headers as received, before the
    // gateway appends its own hop.
    let client_ip = resolve_client_ip(&headers, peer_addr);
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    inject_forwarded_headers(&mut headers, peer_addr, &host);

    let mut ctx = RequestContext::new(
        method.as_str().to_string(),
        uri.path().to_string(),
        headers,
        client_ip,
    )
    .with_query(uri.query());

    let route = match phase_route_match(&ctx, &state) {
        Some(r) => r,
        None => {
            let resp = ctx.reject(&GatewayError::NoRouteMatch);
            log_access(&ctx, resp.status().as_u16());
            return Ok(resp);
        }
    };

    ctx.route_name = route.name.clone();
    ctx.service_id = route.service_id.clone();
    ctx.route = Some(route.clone());

    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "route" => ctx.route_name.clone(),
    )
    .increment(1.0);

    let pipeline = state.pipeline();
    if let Some(resp) = pipeline.on_request(&mut ctx).await {
        log_access(&ctx, resp.status().as_u16());
        return Ok(resp);
    }

    // Upstream gets the canonical path the filters and routes were matched on.
    let mut path_and_query = ctx.uri_path.clone();
    if let Some(q) = &ctx.query {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    let upstream_resp = match phase_upstream(
        method,
        &path_and_query,
        body,
        &mut ctx,
        &route,
        &state,
    )
    .await
    {
        Ok(resp) => resp,
        Err(resp) => {
            log_access(&ctx, resp.status().as_u16());
            return Ok(resp);
        }
    };

    let mut final_resp = build_downstream_response(upstream_resp);
    pipeline.on_response(&ctx, &mut final_resp);

    phase_log(&ctx, &final_resp);
    Ok(final_resp)
}

fn phase_route_match(ctx: &RequestContext, state: &GatewayState) -> Option<Arc<CompiledRoute>> {
    let route = state.routes().match_route(&ctx.uri_path);
    if route.is_none() {
        debug!(
            "proxy: no route matched, host={}, path={}",
            ctx.host, ctx.uri_path
        );
    }
    route
}

async fn phase_upstream(
    method: Method,
    path_and_query: &str,
    body: Incoming,
    ctx: &mut RequestContext,
    route: &CompiledRoute,
    state: &GatewayState,
) -> Result<Response<Incoming>, Response<BoxBody>> {
    let base = route.upstream_for(ctx.gray_version.as_deref());
    ctx.upstream_addr.clear();
    ctx.upstream_addr.push_str(base);

    let mut target = String::with_capacity(base.len() + path_and_query.len());
    target.push_str(base);
    target.push_str(path_and_query);

    // The outgoing header set is final once the filters have run.
    let mut headers = std::mem::take(&mut ctx.headers);
    remove_hop_headers(&mut headers);
    // The client derives Host from the backend URL; the original is in
    // X-Forwarded-Host.
    headers.remove(HOST);

    let mut builder = Request::builder().method(method).uri(&target);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream request, route={}, target={}, error={}",
                ctx.route_name, target, e
            );
            return Err(ctx.reject(&GatewayError::Internal(
                "failed to build upstream request".to_string(),
            )));
        }
    };

    ctx.upstream_start = Some(Instant::now());
    match tokio::time::timeout(route.timeout, state.http_client().request(upstream_req)).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => {
            warn!(
                "proxy: upstream request failed, route={}, upstream={}, error={}",
                ctx.route_name, ctx.upstream_addr, e
            );
            Err(ctx.reject(&GatewayError::UpstreamConnect(
                "upstream request failed".to_string(),
            )))
        }
        Err(_) => {
            warn!(
                "proxy: upstream timeout, route={}, upstream={}, timeout_ms={}",
                ctx.route_name,
                ctx.upstream_addr,
                route.timeout.as_millis()
            );
            Err(ctx.reject(&GatewayError::UpstreamTimeout))
        }
    }
}

fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>) {
    let status = resp.status().as_u16();
    ctx.finalize_metrics(status);
    log_access(ctx, status);
}

/// Structured access log, one line per request at info level.
fn log_access(ctx: &RequestContext, status: u16) {
    let upstream_ms = ctx
        .upstream_start
        .map(|t| t.elapsed().as_millis())
        .unwrap_or(0);

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = status,
        route = %ctx.route_name,
        service = %ctx.service_id,
        version = %ctx.gray_version.as_deref().unwrap_or(""),
        user = %ctx.user_id().unwrap_or(""),
        upstream = %ctx.upstream_addr,
        latency_ms = %ctx.start.elapsed().as_millis(),
        upstream_ms = %upstream_ms,
        "access"
    );
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    static HOP_HEADERS: [HeaderName; 8] = [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in &HOP_HEADERS {
        headers.remove(h);
    }
}

/// Append the peer to `X-Forwarded-For`, default `X-Forwarded-Proto` to
/// `http`, record the original host and overwrite `X-Real-IP` with the
/// immediate peer.
fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
