//! Device-side playback state machine.
//!
//! `transition` is the whole table; `Orchestrator::fire` is the only place
//! that applies it. Background tasks (fetch, completion watch, recovery
//! timer) never touch the state directly, they fire events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::api_client::DecisionSource;
use crate::config::Config;
use crate::error::PlayerError;
use crate::launcher::{terminate, BrowserHandle, Launcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ButtonPressed,
    /// Something is on screen.
    Rendered,
    /// The player exited or the page timed out.
    Finished,
    Failed,
    Recovered,
}

/// Next state for `event` in `state`, or `None` if the event is ignored.
pub fn transition(state: PlaybackState, event: Event) -> Option<PlaybackState> {
    use Event::*;
    use PlaybackState::*;
    match (state, event) {
        (Idle, ButtonPressed) => Some(Loading),
        (Loading, Rendered) => Some(Playing),
        (Loading, Failed) | (Playing, Failed) => Some(Error),
        (Playing, Finished) => Some(Idle),
        (Error, Recovered) => Some(Idle),
        _ => None,
    }
}

/// `true` for locators that go to the kiosk browser instead of the player.
pub fn is_page(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    path.ends_with(".html") || path.ends_with(".htm")
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub page_duration: Duration,
    pub recovery_delay: Duration,
    pub poll_interval: Duration,
}

impl From<&Config> for Timings {
    fn from(c: &Config) -> Self {
        Self {
            page_duration: c.page_duration,
            recovery_delay: c.recovery_delay,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// What fetch-and-render put on screen.
enum Shown {
    Media,
    Page { tracked: bool },
}

#[derive(Default)]
struct Processes {
    player: Option<Child>,
    browser: Option<Child>,
    error_screen: Option<Child>,
}

struct Inner<S, L> {
    source: S,
    launcher: L,
    timings: Timings,
    error_screen_url: Option<String>,
    state: Mutex<PlaybackState>,
    procs: tokio::sync::Mutex<Processes>,
}

pub struct Orchestrator<S, L> {
    inner: Arc<Inner<S, L>>,
}

impl<S, L> Clone for Orchestrator<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DecisionSource, L: Launcher> Orchestrator<S, L> {
    pub fn new(source: S, launcher: L, timings: Timings, error_screen_url: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                launcher,
                timings,
                error_screen_url,
                state: Mutex::new(PlaybackState::Idle),
                procs: tokio::sync::Mutex::new(Processes::default()),
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `event`. Returns the new state, or `None` if it was ignored.
    pub fn fire(&self, event: Event) -> Option<PlaybackState> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        match transition(from, event) {
            Some(to) => {
                *state = to;
                info!(?from, ?to, ?event, "state transition");
                Some(to)
            }
            None => {
                debug!(state = ?from, ?event, "event ignored");
                None
            }
        }
    }

    /// Button handler. Never blocks: the fetch runs on its own task.
    pub fn on_button_press(&self) -> PlaybackState {
        if self.fire(Event::ButtonPressed) == Some(PlaybackState::Loading) {
            let this = self.clone();
            tokio::spawn(async move { this.fetch_and_render().await });
        }
        self.state()
    }

    async fn fetch_and_render(&self) {
        match self.render_next().await {
            Ok(shown) => {
                if self.fire(Event::Rendered).is_some() {
                    let this = self.clone();
                    tokio::spawn(async move { this.watch(shown).await });
                }
            }
            Err(e) => {
                warn!(error = %e, "could not show the next item");
                self.fail().await;
            }
        }
    }

    async fn render_next(&self) -> Result<Shown, PlayerError> {
        let item = self.inner.source.next_item().await?;
        info!(title = %item.title, url = %item.url, placeholder = item.placeholder, "rendering");

        if is_page(&item.url) {
            let handle = self.inner.launcher.open_page(&item.url).await?;
            let tracked = match handle {
                BrowserHandle::Trackable(child) => {
                    self.inner.procs.lock().await.browser = Some(child);
                    true
                }
                BrowserHandle::Untrackable => false,
            };
            Ok(Shown::Page { tracked })
        } else {
            let child = self.inner.launcher.play(&item.url).await?;
            self.inner.procs.lock().await.player = Some(child);
            Ok(Shown::Media)
        }
    }

    /// Completion watcher. Ends with `Finished`, or `Failed` if the player
    /// could not be polled.
    async fn watch(&self, shown: Shown) {
        match shown {
            Shown::Media => loop {
                let polled = {
                    let mut procs = self.inner.procs.lock().await;
                    match procs.player.as_mut().map(|c| c.try_wait()) {
                        // Taken by stop().
                        None => Some(Ok(None)),
                        Some(Ok(Some(status))) => {
                            procs.player = None;
                            Some(Ok(Some(status)))
                        }
                        Some(Ok(None)) => None,
                        Some(Err(e)) => {
                            procs.player = None;
                            Some(Err(e))
                        }
                    }
                };
                match polled {
                    None => tokio::time::sleep(self.inner.timings.poll_interval).await,
                    Some(Ok(Some(status))) if !status.success() => {
                        warn!(%status, "media player exited with an error");
                        break;
                    }
                    Some(Ok(_)) => {
                        info!("playback finished");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "lost track of the media player");
                        self.fail().await;
                        return;
                    }
                }
            },
            Shown::Page { tracked } => {
                tokio::time::sleep(self.inner.timings.page_duration).await;
                let browser = self.inner.procs.lock().await.browser.take();
                match browser {
                    Some(mut child) => terminate(&mut child, "kiosk browser").await,
                    None if !tracked => {
                        warn!("kiosk page was opened without a handle; it has to be closed by hand")
                    }
                    None => {}
                }
            }
        }
        self.fire(Event::Finished);
    }

    /// Enter Error, show the retry screen if there is one, and schedule the
    /// return to Idle.
    async fn fail(&self) {
        if self.fire(Event::Failed).is_none() {
            return;
        }

        if let Some(url) = &self.inner.error_screen_url {
            match self.inner.launcher.open_page(url).await {
                Ok(BrowserHandle::Trackable(child)) => {
                    self.inner.procs.lock().await.error_screen = Some(child);
                }
                Ok(BrowserHandle::Untrackable) => {}
                Err(e) => warn!(error = %e, "could not show the error screen"),
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.timings.recovery_delay).await;
            let screen = this.inner.procs.lock().await.error_screen.take();
            if let Some(mut child) = screen {
                terminate(&mut child, "error screen").await;
            }
            this.fire(Event::Recovered);
        });
    }

    /// Stop everything that is running. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (player, browser, screen) = {
            let mut procs = self.inner.procs.lock().await;
            (procs.player.take(), procs.browser.take(), procs.error_screen.take())
        };
        if let Some(mut child) = player {
            terminate(&mut child, "media player").await;
        }
        if let Some(mut child) = browser {
            terminate(&mut child, "kiosk browser").await;
        }
        if let Some(mut child) = screen {
            terminate(&mut child, "error screen").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::NextItem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::process::Command;

    #[derive(Clone, Copy)]
    enum Reply {
        Item(&'static str),
        Unreachable,
    }

    struct FakeSource {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(reply: Reply) -> Self {
            Self { reply, calls: AtomicUsize::new(0) }
        }
    }

    impl DecisionSource for FakeSource {
        async fn next_item(&self) -> Result<NextItem, PlayerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Item(url) => Ok(NextItem { url: url.into(), title: "Test".into(), placeholder: false }),
                Reply::Unreachable => Err(PlayerError::BadResponse { status: 503 }),
            }
        }
    }

    /// Runs real short-lived processes so exit handling is exercised.
    struct FakeLauncher {
        player_cmd: &'static str,
        page_tracked: bool,
    }

    impl Launcher for FakeLauncher {
        async fn play(&self, _url: &str) -> Result<Child, PlayerError> {
            Command::new("sh")
                .arg("-c")
                .arg(self.player_cmd)
                .spawn()
                .map_err(|source| PlayerError::Launch { program: "sh".into(), source })
        }

        async fn open_page(&self, _url: &str) -> Result<BrowserHandle, PlayerError> {
            if self.page_tracked {
                let child = Command::new("sleep")
                    .arg("30")
                    .spawn()
                    .map_err(|source| PlayerError::Launch { program: "sleep".into(), source })?;
                Ok(BrowserHandle::Trackable(child))
            } else {
                Ok(BrowserHandle::Untrackable)
            }
        }
    }

    fn timings() -> Timings {
        Timings {
            page_duration: Duration::from_millis(50),
            recovery_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn orchestrator(reply: Reply, player_cmd: &'static str) -> Orchestrator<FakeSource, FakeLauncher> {
        Orchestrator::new(
            FakeSource::new(reply),
            FakeLauncher { player_cmd, page_tracked: true },
            timings(),
            None,
        )
    }

    async fn wait_for<S: DecisionSource, L: Launcher>(o: &Orchestrator<S, L>, want: PlaybackState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while o.state() != want {
            assert!(Instant::now() < deadline, "stuck in {:?} waiting for {want:?}", o.state());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn calls<L>(o: &Orchestrator<FakeSource, L>) -> usize {
        o.inner.source.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn transition_table() {
        use Event::*;
        use PlaybackState::*;
        assert_eq!(transition(Idle, ButtonPressed), Some(Loading));
        assert_eq!(transition(Loading, Rendered), Some(Playing));
        assert_eq!(transition(Loading, Failed), Some(Error));
        assert_eq!(transition(Playing, Failed), Some(Error));
        assert_eq!(transition(Playing, Finished), Some(Idle));
        assert_eq!(transition(Error, Recovered), Some(Idle));

        for s in [Loading, Playing, Error] {
            assert_eq!(transition(s, ButtonPressed), None);
        }
        assert_eq!(transition(Idle, Finished), None);
        assert_eq!(transition(Idle, Recovered), None);
        assert_eq!(transition(Error, Failed), None);
    }

    #[test]
    fn pages_are_recognised_by_extension() {
        assert!(is_page("http://pi:8000/static/limit_reached.html"));
        assert!(is_page("http://pi:8000/static/x.HTM?v=2"));
        assert!(!is_page("http://pi:8000/media/library/a.mp4"));
        assert!(!is_page("http://pi:8000/media/library/html.mkv"));
    }

    #[tokio::test]
    async fn press_while_playing_does_not_fetch_again() {
        let o = orchestrator(Reply::Item("http://s/a.mp4"), "sleep 30");

        assert_eq!(o.on_button_press(), PlaybackState::Loading);
        wait_for(&o, PlaybackState::Playing).await;

        assert_eq!(o.on_button_press(), PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls(&o), 1);

        o.stop().await;
        wait_for(&o, PlaybackState::Idle).await;
    }

    #[tokio::test]
    async fn player_exit_returns_to_idle_even_on_failure_status() {
        let o = orchestrator(Reply::Item("http://s/a.mp4"), "exit 3");
        o.on_button_press();
        wait_for(&o, PlaybackState::Idle).await;
        assert_eq!(calls(&o), 1);

        // Ready for the next press.
        assert_eq!(o.on_button_press(), PlaybackState::Loading);
        wait_for(&o, PlaybackState::Idle).await;
        assert_eq!(calls(&o), 2);
    }

    #[tokio::test]
    async fn fetch_failure_recovers_after_delay() {
        let o = orchestrator(Reply::Unreachable, "true");
        o.on_button_press();
        wait_for(&o, PlaybackState::Error).await;

        // Ignored while in Error.
        assert_eq!(o.on_button_press(), PlaybackState::Error);
        assert_eq!(calls(&o), 1);

        wait_for(&o, PlaybackState::Idle).await;
    }

    #[tokio::test]
    async fn launch_failure_routes_to_error() {
        struct BrokenLauncher;
        impl Launcher for BrokenLauncher {
            async fn play(&self, _url: &str) -> Result<Child, PlayerError> {
                Err(PlayerError::Launch {
                    program: "mpv".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
            async fn open_page(&self, _url: &str) -> Result<BrowserHandle, PlayerError> {
                Ok(BrowserHandle::Untrackable)
            }
        }

        let o = Orchestrator::new(FakeSource::new(Reply::Item("http://s/a.mp4")), BrokenLauncher, timings(), None);
        o.on_button_press();
        wait_for(&o, PlaybackState::Error).await;
        wait_for(&o, PlaybackState::Idle).await;
    }

    #[tokio::test]
    async fn failure_during_playback_recovers_to_idle() {
        let o = orchestrator(Reply::Item("http://s/a.mp4"), "sleep 30");
        o.on_button_press();
        wait_for(&o, PlaybackState::Playing).await;

        // What the watcher does when the player can no longer be polled.
        o.fail().await;
        assert_eq!(o.state(), PlaybackState::Error);
        assert_eq!(o.on_button_press(), PlaybackState::Error);

        wait_for(&o, PlaybackState::Idle).await;
        assert_eq!(calls(&o), 1);
        o.stop().await;
    }

    #[tokio::test]
    async fn tracked_page_is_closed_after_its_duration() {
        let o = orchestrator(Reply::Item("http://s/static/limit_reached.html"), "true");
        o.on_button_press();
        wait_for(&o, PlaybackState::Playing).await;
        wait_for(&o, PlaybackState::Idle).await;
        assert!(o.inner.procs.lock().await.browser.is_none());
    }

    #[tokio::test]
    async fn untracked_page_still_returns_to_idle() {
        let o = Orchestrator::new(
            FakeSource::new(Reply::Item("http://s/static/no_content.html")),
            FakeLauncher { player_cmd: "true", page_tracked: false },
            timings(),
            None,
        );
        o.on_button_press();
        wait_for(&o, PlaybackState::Idle).await;
        assert_eq!(calls(&o), 1);
    }

    #[tokio::test]
    async fn error_screen_is_shown_then_closed() {
        let o = Orchestrator::new(
            FakeSource::new(Reply::Unreachable),
            FakeLauncher { player_cmd: "true", page_tracked: true },
            timings(),
            Some("http://s/static/error.html".into()),
        );
        o.on_button_press();
        wait_for(&o, PlaybackState::Error).await;
        wait_for(&o, PlaybackState::Idle).await;
        assert!(o.inner.procs.lock().await.error_screen.is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let o = orchestrator(Reply::Item("http://s/a.mp4"), "true");
        o.stop().await;
        o.stop().await;
        assert_eq!(o.state(), PlaybackState::Idle);
    }
}
