use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::history::RetryPolicy;

/// Runtime configuration for the engine.
///
/// Every value can be overridden with an `ONEBUTTON_*` environment variable.
/// The struct is built once in `main` and handed to the components that need
/// it; nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    /// Root of the media catalog. Scans walk this directory and the player
    /// fetches files from it under `/media/library`.
    pub media_dir: PathBuf,
    /// Limit / no-content pages, served under `/static`.
    pub static_dir: PathBuf,
    pub default_daily_limit: u32,
    pub play_log_retry: RetryPolicy,
    pub probe_durations: bool,
    pub ffprobe: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./onebutton.db"),
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            media_dir: PathBuf::from("./media/library"),
            static_dir: PathBuf::from("./static"),
            default_daily_limit: 3,
            play_log_retry: RetryPolicy::default(),
            probe_durations: false,
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = var("ONEBUTTON_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ONEBUTTON_BIND") {
            cfg.bind = v
                .parse()
                .with_context(|| format!("invalid ONEBUTTON_BIND: {v}"))?;
        }
        if let Some(v) = var("ONEBUTTON_MEDIA_DIR") {
            cfg.media_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ONEBUTTON_STATIC_DIR") {
            cfg.static_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ONEBUTTON_DEFAULT_DAILY_LIMIT") {
            let limit: u32 = v
                .parse()
                .with_context(|| format!("invalid ONEBUTTON_DEFAULT_DAILY_LIMIT: {v}"))?;
            if limit == 0 {
                anyhow::bail!("ONEBUTTON_DEFAULT_DAILY_LIMIT must be positive");
            }
            cfg.default_daily_limit = limit;
        }
        if let Some(v) = var("ONEBUTTON_PLAY_LOG_RETRIES") {
            cfg.play_log_retry.retries = v
                .parse()
                .with_context(|| format!("invalid ONEBUTTON_PLAY_LOG_RETRIES: {v}"))?;
        }
        if let Some(v) = var("ONEBUTTON_PLAY_LOG_BACKOFF_MS") {
            let ms: u64 = v
                .parse()
                .with_context(|| format!("invalid ONEBUTTON_PLAY_LOG_BACKOFF_MS: {v}"))?;
            cfg.play_log_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(v) = var("ONEBUTTON_PROBE_DURATIONS") {
            cfg.probe_durations = matches!(v.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = var("ONEBUTTON_FFPROBE") {
            cfg.ffprobe = v;
        }

        Ok(cfg)
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
