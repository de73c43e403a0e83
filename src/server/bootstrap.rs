use crate::auth::RefreshOutcome;
use crate::config::GatewayConfig;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → build → warm up → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: config and state. Filters and routes are fixed from here on.
    let config = GatewayConfig::load(&args.config_path)?;
    let state = GatewayState::new(config, Some(args.config_path.clone()))?;

    // Phase 2: warm up. Keys must be loaded before the first request; a
    // failing issuer is logged and retried by the refresh loop.
    warm_up(&state).await;

    // Phase 3: background loops, all stopped by `shutdown`.
    let shutdown = Arc::new(Notify::new());
    start_background_tasks(&state, &shutdown);

    // Phase 4: admin and proxy servers.
    start_admin_server(&state, &args);

    tracing::info!(
        "server: starting gateway, listen={}, filters={:?}",
        args.listen,
        state.pipeline().names()
    );

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 5: block until signal, then wait for the drain.
    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy stopped with error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn warm_up(state: &GatewayState) {
    if let Some(auth) = &state.components.authenticator {
        match auth.keys().refresh_all(true).await {
            RefreshOutcome::Completed { loaded, failed } => {
                let snapshot = auth.keys().snapshot();
                tracing::info!(
                    "auth: keystore: initial load, issuers_loaded={}, issuers_failed={}, keys={}",
                    loaded,
                    failed,
                    snapshot.key_count()
                );
            }
            RefreshOutcome::Skipped => {}
        }
    }

    // The connection manager is lazy; connecting now only surfaces a bad
    // address early. Failures here are not fatal.
    if let Some(kv) = &state.components.kv {
        match kv.ping().await {
            Ok(()) => tracing::info!("kv: redis reachable"),
            Err(e) => tracing::warn!("kv: redis not reachable at startup, error={}", e),
        }
    }
}

fn start_background_tasks(state: &GatewayState, shutdown: &Arc<Notify>) {
    let c = &state.components;
    if let Some(auth) = &c.authenticator {
        let interval = Duration::from_secs(state.config.load().auth.refresh_interval_secs.max(1));
        auth.keys().start_refresh_task(interval, shutdown.clone());
    }
    c.local_buckets.start_gc(shutdown.clone());
    c.gray.sticky().start_gc(shutdown.clone());
}

fn start_admin_server(state: &GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
