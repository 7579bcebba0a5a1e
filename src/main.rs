use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_router::auth::StoreAuthGate;
use dispatch_router::config::RouterConfig;
use dispatch_router::router::{
    RouterState, Scheduler, internal_routes, spawn_backlog_poller, worker_routes,
};
use dispatch_router::store::{Database, LibSqlBackend};

/// How long shutdown waits for worker sockets to finish cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("Invalid router configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("🛰  Dispatch router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker WS: ws://0.0.0.0:{}/ws", config.ws_port);
    eprintln!("   Internal API: http://127.0.0.1:{}/stats", config.internal_port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Storage ───────────────────────────────────────────────────────
    let db = open_store(&config).await.context("Failed to open database")?;

    let signal = shutdown_signal().context("Failed to install signal handlers")?;

    // ── Scheduler + poller ────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&db), config.overload_threshold));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = spawn_backlog_poller(
        Arc::clone(&db),
        Arc::clone(&scheduler),
        config.poll_interval,
        shutdown_rx.clone(),
    );

    // ── Servers ───────────────────────────────────────────────────────
    let state = RouterState {
        scheduler: Arc::clone(&scheduler),
        auth: Arc::new(StoreAuthGate::new(Arc::clone(&db))),
        store: Arc::clone(&db),
        heartbeat_interval: config.heartbeat_interval,
        drain_timeout: config.drain_timeout,
        shutdown: shutdown_rx.clone(),
    };

    let ws_addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind worker port {}", config.ws_port))?;
    let internal_addr = SocketAddr::from(([127, 0, 0, 1], config.internal_port));
    let internal_listener = tokio::net::TcpListener::bind(internal_addr)
        .await
        .with_context(|| format!("Failed to bind internal port {}", config.internal_port))?;

    tracing::info!(port = config.ws_port, "Worker WebSocket server started");
    tracing::info!(port = config.internal_port, "Internal API started");

    let ws_server = {
        let mut shutdown = shutdown_rx.clone();
        axum::serve(ws_listener, worker_routes(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
    };
    let internal_server = {
        let mut shutdown = shutdown_rx.clone();
        axum::serve(internal_listener, internal_routes(Arc::clone(&scheduler)))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
    };

    let servers = tokio::spawn(async move {
        let (ws, internal) =
            futures::future::join(ws_server.into_future(), internal_server.into_future()).await;
        if let Err(e) = ws {
            tracing::error!(error = %e, "Worker server failed");
        }
        if let Err(e) = internal {
            tracing::error!(error = %e, "Internal API failed");
        }
    });

    signal.await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, resetting workers");
    let _ = shutdown_tx.send(true);

    let _ = poller.await;
    wait_for_workers(&scheduler).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, servers).await;
    scheduler.flush().await;

    tracing::info!("Router stopped");
    Ok(())
}

/// Read `.env` (if present) and the process environment.
fn load_config() -> dispatch_router::error::Result<RouterConfig> {
    dotenvy::dotenv().ok();
    Ok(RouterConfig::from_env()?)
}

/// Open the database and clear state left by a previous process.
async fn open_store(config: &RouterConfig) -> dispatch_router::error::Result<Arc<dyn Database>> {
    let backend = LibSqlBackend::new_local(&config.db_path).await?;
    let recovered = backend.recover_stale_state().await?;
    if recovered.released_claims > 0 || recovered.released_tasks > 0 {
        tracing::info!(
            released_claims = recovered.released_claims,
            released_tasks = recovered.released_tasks,
            "Recovered state from previous run"
        );
    }
    Ok(Arc::new(backend))
}

/// Stderr logging, plus daily log files when a log directory is configured.
fn init_tracing(config: &RouterConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

/// Install the shutdown handlers. The returned future resolves on Ctrl-C,
/// or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl Future<Output = std::io::Result<()>>> {
    #[cfg(unix)]
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = term.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate => Ok(()),
        }
    })
}

/// Wait until every worker session has gone through disconnect cleanup.
async fn wait_for_workers(scheduler: &Scheduler) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while scheduler.stats().await.workers > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("Workers still connected at shutdown deadline");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
