//! "What should client X watch next?"
//!
//! Order of evaluation, no backtracking:
//!   1. make sure the client has a profile
//!   2. the head of the client's queue, skipping entries whose item is gone
//!   3. otherwise the daily limit, then a uniform random pick from the catalog
//!
//! Queued items bypass the limit but still count as plays. Every served item
//! is logged through the retrying play-log path; a failed log write never
//! stops the item from being served.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::catalog::{self, MediaItem};
use crate::clients;
use crate::db::Db;
use crate::error::EngineResult;
use crate::history::{self, RetryPolicy};
use crate::queue;

/// Fixed page shown once the effective limit is used up.
pub const LIMIT_SCREEN_URL: &str = "/static/limit_reached.html";
pub const LIMIT_SCREEN_TITLE: &str = "All done for today!";
/// Fixed page shown when there is nothing in the catalog to pick from.
pub const NO_CONTENT_URL: &str = "/static/no_content.html";
pub const NO_CONTENT_TITLE: &str = "Nothing to watch yet";

/// URL prefix the media directory is served under.
pub const MEDIA_URL_PREFIX: &str = "/media/library";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Queue,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ServeItem { item: MediaItem, source: Source },
    ServeLimitScreen,
    ServeNoContent,
}

/// Wire form of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextResponse {
    pub url: String,
    pub title: String,
    /// `true` for the limit and no-content pages.
    pub placeholder: bool,
}

impl Decision {
    pub fn to_response(&self) -> NextResponse {
        match self {
            Decision::ServeItem { item, .. } => NextResponse {
                url: media_url(&item.path),
                title: item.title.clone(),
                placeholder: false,
            },
            Decision::ServeLimitScreen => NextResponse {
                url: LIMIT_SCREEN_URL.to_string(),
                title: LIMIT_SCREEN_TITLE.to_string(),
                placeholder: true,
            },
            Decision::ServeNoContent => NextResponse {
                url: NO_CONTENT_URL.to_string(),
                title: NO_CONTENT_TITLE.to_string(),
                placeholder: true,
            },
        }
    }
}

pub fn media_url(rel_path: &str) -> String {
    format!("{MEDIA_URL_PREFIX}/{}", rel_path.trim_start_matches('/'))
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    db: Db,
    default_daily_limit: u32,
    play_log_retry: RetryPolicy,
}

impl DecisionEngine {
    pub fn new(db: Db, default_daily_limit: u32, play_log_retry: RetryPolicy) -> Self {
        Self {
            db,
            default_daily_limit,
            play_log_retry,
        }
    }

    pub async fn decide_next(&self, client_id: &str) -> EngineResult<Decision> {
        self.decide_next_at(client_id, OffsetDateTime::now_utc()).await
    }

    /// Same as [`decide_next`](Self::decide_next) with an explicit clock.
    ///
    /// Only the queue claim is atomic. The limit check and the play-log write
    /// are separate store calls, so two random picks racing at one play below
    /// the limit can both be served and the day ends one over.
    pub async fn decide_next_at(&self, client_id: &str, now: OffsetDateTime) -> EngineResult<Decision> {
        let cid = client_id.to_string();
        let default_limit = self.default_daily_limit;

        let decision = self
            .db
            .call(move |conn| {
                let profile = clients::get_or_create(conn, &cid, default_limit, now)?;

                while let Some(entry) = queue::dequeue_next(conn, &cid)? {
                    match catalog::get(conn, entry.media_item_id)? {
                        Some(item) => {
                            debug!(client_id = %cid, entry = %entry.id, "serving queued item");
                            return Ok(Decision::ServeItem { item, source: Source::Queue });
                        }
                        None => {
                            warn!(
                                client_id = %cid,
                                entry = %entry.id,
                                media_item_id = entry.media_item_id,
                                "discarding queue entry for missing media item"
                            );
                        }
                    }
                }

                let today = now.date();
                let played = history::count_on_day(conn, &cid, today)?;
                let limit = profile.effective_limit(today);
                if played >= limit {
                    debug!(client_id = %cid, played, limit, "daily limit reached");
                    return Ok(Decision::ServeLimitScreen);
                }

                Ok(match catalog::random(conn)? {
                    Some(item) => Decision::ServeItem { item, source: Source::Random },
                    None => Decision::ServeNoContent,
                })
            })
            .await?;

        if let Decision::ServeItem { item, source } = &decision {
            info!(client_id, media_item_id = item.id, title = %item.title, ?source, "serving item");
            history::record_play_safe(&self.db, self.play_log_retry, client_id, item.id, now).await;
        }

        Ok(decision)
    }
}
