use std::future::Future;

use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::error::PlayerError;

/// Body of `GET /api/next`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NextItem {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub placeholder: bool,
}

/// Where the orchestrator gets its next item from.
pub trait DecisionSource: Send + Sync + 'static {
    /// The next thing to show. `url` is absolute.
    fn next_item(&self) -> impl Future<Output = Result<NextItem, PlayerError>> + Send;
}

pub struct HttpDecisionSource {
    http: reqwest::Client,
    server_url: String,
    client_id: String,
}

impl HttpDecisionSource {
    pub fn new(config: &Config) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            server_url: config.server_url.clone(),
            client_id: config.client_id.clone(),
        })
    }
}

impl DecisionSource for HttpDecisionSource {
    async fn next_item(&self) -> Result<NextItem, PlayerError> {
        let resp = self
            .http
            .get(format!("{}/api/next", self.server_url.trim_end_matches('/')))
            .query(&[("client_id", self.client_id.as_str())])
            .send()
            .await
            .map_err(PlayerError::UpstreamUnavailable)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PlayerError::BadResponse { status: status.as_u16() });
        }

        let mut item: NextItem = resp.json().await.map_err(PlayerError::UpstreamUnavailable)?;
        item.url = join_url(&self.server_url, &item.url);
        debug!(url = %item.url, title = %item.title, placeholder = item.placeholder, "decision received");
        Ok(item)
    }
}

/// Resolve a server-relative locator against the server base. Absolute URLs
/// pass through.
pub fn join_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
}
