// OneButton player
//
// Runs on the device next to the screen. A button press asks the engine
// what to show, renders it with mpv or a kiosk browser, and waits for it to
// finish. Enter on stdin stands in for the hardware button.

mod api_client;
mod button;
mod config;
mod error;
mod launcher;
mod orchestrator;

use tokio::io::BufReader;
use tracing::{info, warn};

use crate::api_client::{join_url, HttpDecisionSource};
use crate::config::Config;
use crate::launcher::SystemLauncher;
use crate::orchestrator::{Orchestrator, Timings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(
        server = %config.server_url,
        client_id = %config.client_id,
        player = %config.player,
        "OneButton player {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let source = HttpDecisionSource::new(&config)?;
    let launcher = SystemLauncher::new(config.player.clone(), config.browser.clone());
    let error_screen = config
        .error_screen
        .as_deref()
        .map(|url| join_url(&config.server_url, url));
    let orchestrator = Orchestrator::new(source, launcher, Timings::from(&config), error_screen);

    info!("Press Enter to play the next video. Ctrl-C to quit.");

    let presses = {
        let orchestrator = orchestrator.clone();
        button::press_on_lines(BufReader::new(tokio::io::stdin()), move || {
            orchestrator.on_button_press();
        })
    };

    tokio::select! {
        r = presses => match r {
            Ok(n) => info!(presses = n, "button input closed"),
            Err(e) => warn!(error = %e, "button input failed"),
        },
        signal = shutdown_signal() => warn!(signal, "stop requested; shutting playback down"),
    }

    orchestrator.stop().await;
    Ok(())
}

/// Resolves with the name of the first stop request: Ctrl-C or SIGTERM.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "ctrl-c",
        _ = term => "SIGTERM",
    }
}
