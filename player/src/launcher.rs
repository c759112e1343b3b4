use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::PlayerError;

/// Fullscreen, no on-screen controls, ignore the terminal.
pub const PLAYER_ARGS: [&str; 4] = ["--fs", "--no-osc", "--no-osd-bar", "--no-input-terminal"];
pub const KIOSK_ARGS: [&str; 4] = ["--kiosk", "--noerrdialogs", "--disable-infobars", "--no-first-run"];
/// Searched on PATH, in order, when no browser is configured.
pub const BROWSER_CANDIDATES: [&str; 3] = ["chromium-browser", "chromium", "google-chrome"];

/// A player that dies with an error within this window failed to launch.
const LAUNCH_GRACE: Duration = Duration::from_millis(100);
const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A kiosk page we may or may not be able to close again.
#[derive(Debug)]
pub enum BrowserHandle {
    Trackable(Child),
    /// Opened through the desktop's URL handler; nothing to wait on or kill.
    Untrackable,
}

/// Starts the external processes the orchestrator renders with.
pub trait Launcher: Send + Sync + 'static {
    fn play(&self, url: &str) -> impl Future<Output = Result<Child, PlayerError>> + Send;
    fn open_page(&self, url: &str) -> impl Future<Output = Result<BrowserHandle, PlayerError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SystemLauncher {
    player: String,
    browser: Option<String>,
}

impl SystemLauncher {
    pub fn new(player: impl Into<String>, browser: Option<String>) -> Self {
        Self {
            player: player.into(),
            browser,
        }
    }

    fn browser(&self) -> Option<PathBuf> {
        match &self.browser {
            Some(b) => Some(PathBuf::from(b)),
            None => BROWSER_CANDIDATES.iter().find_map(|name| find_in_path(name)),
        }
    }
}

impl Launcher for SystemLauncher {
    async fn play(&self, url: &str) -> Result<Child, PlayerError> {
        info!(player = %self.player, url, "starting media player");
        let mut child = spawn(Path::new(&self.player), &PLAYER_ARGS, url)?;

        tokio::time::sleep(LAUNCH_GRACE).await;
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => Err(PlayerError::EarlyExit {
                program: self.player.clone(),
                status,
            }),
            Ok(_) => Ok(child),
            Err(source) => Err(PlayerError::Launch {
                program: self.player.clone(),
                source,
            }),
        }
    }

    async fn open_page(&self, url: &str) -> Result<BrowserHandle, PlayerError> {
        if let Some(browser) = self.browser() {
            info!(browser = %browser.display(), url, "opening kiosk page");
            let child = spawn(&browser, &KIOSK_ARGS, url)?;
            return Ok(BrowserHandle::Trackable(child));
        }

        let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
        warn!(opener, url, "no kiosk browser found; page cannot be closed automatically");
        // The opener hands off to the desktop and exits; its child is not ours.
        spawn(Path::new(opener), &[], url)?;
        Ok(BrowserHandle::Untrackable)
    }
}

fn spawn(program: &Path, args: &[&str], url: &str) -> Result<Child, PlayerError> {
    Command::new(program)
        .args(args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| PlayerError::Launch {
            program: program.display().to_string(),
            source,
        })
}

/// First executable file called `name` on PATH.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(p)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(p: &Path) -> bool {
    p.is_file()
}

/// Ask `child` to exit, wait up to two seconds, then kill it.
pub async fn terminate(child: &mut Child, what: &str) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(what, pid, error = %e, "failed to send SIGTERM");
        }
    }

    let polls = (STOP_GRACE.as_millis() / STOP_POLL.as_millis()) as u32;
    for _ in 0..polls {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(what, %status, "process stopped");
                return;
            }
            Ok(None) => tokio::time::sleep(STOP_POLL).await,
            Err(e) => {
                warn!(what, error = %e, "failed to poll process");
                break;
            }
        }
    }

    warn!(what, "process ignored SIGTERM; killing");
    if let Err(e) = child.kill().await {
        warn!(what, error = %e, "failed to kill process");
    }
}
