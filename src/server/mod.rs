mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::{Components, GatewayState};

use crate::proxy::{self, BoxBody};
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Tracks live proxy connections. The gauge mirrors the atomic, which is
/// kept because metrics gauges cannot be read back.
#[derive(Clone, Default)]
struct ConnTracker {
    active: Arc<AtomicI64>,
}

struct ConnGuard {
    active: Arc<AtomicI64>,
}

impl ConnTracker {
    fn open(&self) -> ConnGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("gateway_connections_active").increment(1.0);
        ConnGuard {
            active: self.active.clone(),
        }
    }

    fn active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait for open connections to finish, bounded by `DRAIN_TIMEOUT`.
    async fn drain(&self) {
        if self.active() <= 0 {
            return;
        }
        info!("server: proxy draining, active={}", self.active());
        let idle = async {
            while self.active() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, idle).await.is_ok() {
            info!("server: proxy drained");
        } else {
            warn!(
                "server: proxy drain timed out, timeout_secs={}, active={}",
                DRAIN_TIMEOUT.as_secs(),
                self.active()
            );
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("gateway_connections_active").decrement(1.0);
    }
}

async fn bind(listen: &str, kind: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: {} listening, addr={}", kind, addr);
    Ok(listener)
}

/// Serve one connection with HTTP/1 keep-alive, and HTTP/2 when `h2` is set.
async fn serve_conn<F, Fut>(stream: TcpStream, h2: bool, handler: F) -> Result<(), String>
where
    F: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response<BoxBody>, hyper::Error>> + Send + 'static,
{
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(true);
    if h2 {
        builder
            .http2()
            .keep_alive_interval(Some(Duration::from_secs(20)));
    }
    match builder
        .serve_connection(TokioIo::new(stream), service_fn(handler))
        .await
    {
        Ok(()) => Ok(()),
        // Clients hanging up is routine.
        Err(e) if e.to_string().contains("connection closed") => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Run the main proxy server with graceful shutdown support.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    serve_proxy(bind(listen, "proxy").await?, state, shutdown).await
}

/// Accept loop on an already bound listener.
///
/// Once `shutdown` fires no new connections are accepted; open ones get up to
/// `DRAIN_TIMEOUT` to finish.
pub async fn serve_proxy(
    listener: TcpListener,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let conns = ConnTracker::default();
    // Registered once so a signal that arrives between accepts is not lost.
    let stop = shutdown.notified();
    tokio::pin!(stop);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("server: proxy accept failed, error={}", e);
                    metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                    continue;
                }
            },
            _ = &mut stop => {
                info!("server: proxy stopped accepting");
                break;
            }
        };
        metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);

        let guard = conns.open();
        let state = state.clone();
        tokio::spawn(async move {
            let handler = move |req| proxy::handle_request(req, state.clone(), peer);
            if let Err(e) = serve_conn(stream, true, handler).await {
                error!("server: proxy connection error, peer={}, error={}", peer, e);
            }
            drop(guard);
        });
    }

    conns.drain().await;
    Ok(())
}

/// Run the admin server: health, readiness, metrics and operational
/// endpoints.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    serve_admin(bind(listen, "admin").await?, state).await
}

pub async fn serve_admin(listener: TcpListener, state: GatewayState) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let handler = move |req| admin::handle_admin(req, state.clone());
            if let Err(e) = serve_conn(stream, false, handler).await {
                error!("server: admin connection error, error={}", e);
            }
        });
    }
}
