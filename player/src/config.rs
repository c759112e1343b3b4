use std::time::Duration;

use anyhow::Context;

/// Device-side settings, read once from `ONEBUTTON_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub client_id: String,
    pub request_timeout: Duration,
    /// Media player binary (mpv or a compatible CLI).
    pub player: String,
    /// Kiosk browser binary. `None` searches PATH.
    pub browser: Option<String>,
    /// How long a kiosk page stays up before it is closed.
    pub page_duration: Duration,
    /// Time spent in Error before returning to Idle.
    pub recovery_delay: Duration,
    /// Friendly retry page shown while in Error.
    pub error_screen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            client_id: "default-client".to_string(),
            request_timeout: Duration::from_secs(10),
            player: "mpv".to_string(),
            browser: None,
            page_duration: Duration::from_secs(5),
            recovery_delay: Duration::from_secs(5),
            error_screen: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = var("ONEBUTTON_SERVER_URL") {
            cfg.server_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = var("ONEBUTTON_CLIENT_ID") {
            cfg.client_id = v;
        }
        if let Some(v) = var("ONEBUTTON_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = secs("ONEBUTTON_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("ONEBUTTON_PLAYER") {
            cfg.player = v;
        }
        cfg.browser = var("ONEBUTTON_BROWSER");
        if let Some(v) = var("ONEBUTTON_PAGE_SECS") {
            cfg.page_duration = secs("ONEBUTTON_PAGE_SECS", &v)?;
        }
        if let Some(v) = var("ONEBUTTON_RECOVERY_SECS") {
            cfg.recovery_delay = secs("ONEBUTTON_RECOVERY_SECS", &v)?;
        }
        cfg.error_screen = var("ONEBUTTON_ERROR_SCREEN");

        Ok(cfg)
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(key: &str, v: &str) -> anyhow::Result<Duration> {
    let n: u64 = v.parse().with_context(|| format!("invalid {key}: {v}"))?;
    Ok(Duration::from_secs(n))
}
