mod clock;
mod config;
mod error;
mod handlers;
mod imaging;
mod llm;
mod metrics;
mod models;
mod routes;
mod security;
mod state;

use clock::{Clock, SystemClock};
use config::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often idle rate-limit windows are dropped
const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    tracing::info!(provider = ?config.provider, "initializing security systems");
    let provider = state::build_provider(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bind_address = config.bind_address();

    let mut state = state::AppState::new(config, provider, clock)?;
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state = state.with_prometheus(handle),
        Err(e) => tracing::warn!(error = %e, "prometheus recorder not installed"),
    }

    let policy = state.rate_limiter.policy();
    tracing::info!(
        max_requests = policy.max_requests,
        window_secs = policy.window.num_seconds(),
        blacklist_threshold = state.reputation.threshold(),
        admin_api = state.config.admin_api_enabled,
        "security systems initialized"
    );

    spawn_window_pruning(state.clone());

    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically forget clients with empty rate-limit windows and log security stats.
fn spawn_window_pruning(state: state::AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        // First tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.rate_limiter.prune_idle(state.clock.now());
            let stats = state.reputation.system_stats();
            tracing::info!(
                pruned_windows = removed,
                rate_limited_clients = state.rate_limiter.tracked_clients(),
                tracked_clients = stats.total_ips_tracked,
                blacklisted_clients = stats.blacklisted_ips,
                violations = stats.total_violations,
                blocked_requests = state.metrics.blocked_requests(),
                verdicts = state.metrics.verdicts(),
                completions = state.metrics.completions(),
                "security stats"
            );
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
