// OneButton engine
//
// Answers one question for every device: "what should this client play
// next?" Queue first, then the daily limit, then a random pick from the
// catalog. Also hosts the admin endpoints and serves the media files.

mod api;
mod catalog;
mod clients;
mod config;
mod db;
mod decision;
mod error;
mod history;
mod queue;

use tracing::{info, warn};

use crate::api::{build_router, scan_catalog, AppState};
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;
    let addr = config.bind;
    info!(
        db = %config.db_path.display(),
        media = %config.media_dir.display(),
        default_daily_limit = config.default_daily_limit,
        "configuration loaded"
    );

    let state = AppState::new(config);
    state.db.init().await?;

    // Startup sync is best effort; the admin scan endpoint can be retried later.
    match scan_catalog(&state).await {
        Ok(report) => info!(?report, "initial catalog sync done"),
        Err(e) => warn!(error = %e, "initial catalog sync skipped"),
    }

    let app = build_router(state);

    info!("OneButton engine {} starting on http://{addr}", env!("CARGO_PKG_VERSION"));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
