#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tollgate::proxy::context::RequestContext;

pub const JWKS: &str = include_str!("../fixtures/jwks.json");
const EC_PEM: &[u8] = include_bytes!("../fixtures/ec_private.pem");

/// Issuer name the fixture keys are registered under.
pub const ISSUER: &str = "main";

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn es256(claims: Value) -> String {
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some("ec-key-1".to_string());
    encode(&header, &claims, &EncodingKey::from_ec_pem(EC_PEM).unwrap()).unwrap()
}

/// A valid token for `sub`, expiring in ten minutes.
pub fn token_for(sub: &str) -> String {
    es256(json!({
        "sub": sub,
        "iss": ISSUER,
        "username": format!("{}-name", sub),
        "roles": ["reader", "writer"],
        "exp": unix_now() + 600,
    }))
}

async fn serve<F, Fut>(handler: F) -> String
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    format!("http://{}", addr)
}

/// Serve the fixture JWKS document. Returns its URL and a hit counter.
pub async fn start_jwks_server() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let base = serve(move |_req| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from_static(JWKS.as_bytes())))
                .unwrap()
        }
    })
    .await;
    (format!("{}/.well-known/jwks.json", base), hits)
}

/// Backend that answers with its name, the path and the identity and
/// version headers it received.
pub async fn start_echo_backend(name: &'static str) -> String {
    serve(move |req: Request<Incoming>| async move {
        let header = |n: &str| {
            req.headers()
                .get(n)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let body = json!({
            "backend": name,
            "path": req.uri().path_and_query().map(|pq| pq.as_str()),
            "user_id": header("x-user-id"),
            "username": header("x-username"),
            "roles": header("x-roles"),
            "version": header("x-gray-version"),
            "authorization": header("authorization"),
            "forwarded_for": header("x-forwarded-for"),
        });
        Response::builder()
            .header("content-type", "application/json")
            .header("x-backend", name)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    })
    .await
}

pub fn request_ctx(path: &str, service_id: &str, headers: http::HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::new(
        "GET".to_string(),
        path.to_string(),
        headers,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
    );
    ctx.route_name = service_id.to_string();
    ctx.service_id = service_id.to_string();
    ctx
}

pub fn bearer(token: &str) -> http::HeaderMap {
    let mut h = http::HeaderMap::new();
    h.insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );
    h
}
