use std::process::ExitStatus;

/// Everything that can go wrong between a button press and something on
/// screen. All of these route the orchestrator to Error; none are fatal.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("decision server unavailable: {0}")]
    UpstreamUnavailable(#[source] reqwest::Error),

    #[error("decision server answered with status {status}")]
    BadResponse { status: u16 },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited right after launch ({status})")]
    EarlyExit { program: String, status: ExitStatus },
}
