use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{self, MediaItem, ScanOptions, ScanReport};
use crate::clients::{self, ClientUpdate, ClientView, NewClient};
use crate::config::Config;
use crate::db::{format_rfc3339, Db};
use crate::decision::{DecisionEngine, NextResponse, MEDIA_URL_PREFIX};
use crate::error::{EngineError, EngineResult};
use crate::history;
use crate::queue::{self, QueueEntry};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub config: Arc<Config>,
    pub db: Db,
    pub engine: DecisionEngine,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let db = Db::new(&config.db_path);
        let engine = DecisionEngine::new(db.clone(), config.default_daily_limit, config.play_log_retry);
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: Arc::new(config),
            db,
            engine,
        }
    }
}

async fn root() -> &'static str {
    "OneButton engine is running. Try /api/next?client_id=<id>"
}

pub fn build_router(state: AppState) -> Router {
    let media = ServeDir::new(&state.config.media_dir);
    let pages = ServeDir::new(&state.config.static_dir);

    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/ping", get(ping))
        .route("/api/next", get(api_next))
        .route("/api/queue/:client_id", get(api_queue_list).post(api_queue_add))
        .route("/api/queue/:client_id/clear", post(api_queue_clear))
        .route("/api/queue/:client_id/reorder", put(api_queue_reorder))
        .route("/api/queue/:client_id/:entry_id", delete(api_queue_remove))
        .route("/api/clients", get(api_clients_list).post(api_clients_create))
        .route(
            "/api/clients/:client_id",
            get(api_clients_get).patch(api_clients_update).put(api_clients_update),
        )
        .route("/api/clients/:client_id/add-bonus-plays", post(api_add_bonus_plays))
        .route("/api/videos", get(api_videos_list))
        .route("/api/videos/scan", post(api_videos_scan))
        .route("/api/videos/:video_id", delete(api_videos_delete))
        .route("/api/plays/:record_id/complete", post(api_play_complete))
        .route("/api/stats", get(api_stats))
        .route("/api/stats/client/:client_id", get(api_client_stats))
        .nest_service(MEDIA_URL_PREFIX, media)
        .nest_service("/static", pages)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": state.version }))
}

// --- Decision -----------------------------------------------------------------

#[derive(Deserialize)]
struct NextQuery {
    client_id: String,
}

async fn api_next(
    State(state): State<AppState>,
    Query(q): Query<NextQuery>,
) -> EngineResult<Json<NextResponse>> {
    let client_id = q.client_id.trim();
    if client_id.is_empty() {
        return Err(EngineError::Validation("client_id is required".into()));
    }
    let decision = state.engine.decide_next(client_id).await?;
    Ok(Json(decision.to_response()))
}

// --- Queue --------------------------------------------------------------------

#[derive(Serialize)]
struct QueueItemView {
    id: Uuid,
    position: u32,
    video_id: i64,
    title: Option<String>,
    path: Option<String>,
    created_at: String,
}

fn queue_view(conn: &rusqlite::Connection, client_id: &str) -> EngineResult<Vec<QueueItemView>> {
    queue::list(conn, client_id)?
        .into_iter()
        .map(|e: QueueEntry| {
            let item = catalog::get(conn, e.media_item_id)?;
            Ok(QueueItemView {
                id: e.id,
                position: e.position,
                video_id: e.media_item_id,
                title: item.as_ref().map(|i| i.title.clone()),
                path: item.map(|i| i.path),
                created_at: format_rfc3339(e.created_at),
            })
        })
        .collect()
}

async fn api_queue_list(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> EngineResult<Json<Vec<QueueItemView>>> {
    let items = state.db.call(move |conn| queue_view(conn, &client_id)).await?;
    Ok(Json(items))
}

#[derive(Deserialize)]
struct QueueAddReq {
    video_ids: Vec<i64>,
    /// Insert the batch starting here instead of appending.
    #[serde(default)]
    position: Option<u32>,
}

async fn api_queue_add(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<QueueAddReq>,
) -> EngineResult<Json<serde_json::Value>> {
    if req.video_ids.is_empty() {
        return Err(EngineError::Validation("video_ids must not be empty".into()));
    }
    let default_limit = state.config.default_daily_limit;
    let (added, total) = state
        .db
        .call(move |conn| {
            let now = OffsetDateTime::now_utc();
            clients::get_or_create(conn, &client_id, default_limit, now)?;
            let added = queue::enqueue(conn, &client_id, &req.video_ids, req.position, now)?;
            let total = queue::count(conn, &client_id)?;
            info!(client_id = %client_id, added = added.len(), total, "queued videos");
            Ok((added.len(), total))
        })
        .await?;
    Ok(Json(json!({ "added": added, "total_in_queue": total })))
}

async fn api_queue_remove(
    State(state): State<AppState>,
    Path((client_id, entry_id)): Path<(String, Uuid)>,
) -> EngineResult<Json<serde_json::Value>> {
    state
        .db
        .call(move |conn| queue::remove(conn, &client_id, entry_id))
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_queue_clear(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> EngineResult<Json<serde_json::Value>> {
    let removed = state.db.call(move |conn| queue::clear(conn, &client_id)).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct QueueReorderReq {
    queue_ids: Vec<Uuid>,
}

async fn api_queue_reorder(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<QueueReorderReq>,
) -> EngineResult<Json<Vec<QueueItemView>>> {
    let items = state
        .db
        .call(move |conn| {
            queue::reorder(conn, &client_id, &req.queue_ids)?;
            queue_view(conn, &client_id)
        })
        .await?;
    Ok(Json(items))
}

// --- Clients ------------------------------------------------------------------

async fn api_clients_list(State(state): State<AppState>) -> EngineResult<Json<Vec<ClientView>>> {
    let list = state.db.call(|conn| clients::list(conn)).await?;
    Ok(Json(list.iter().map(ClientView::from).collect()))
}

async fn api_clients_create(
    State(state): State<AppState>,
    Json(req): Json<NewClient>,
) -> EngineResult<(StatusCode, Json<ClientView>)> {
    let default_limit = state.config.default_daily_limit;
    let client = state
        .db
        .call(move |conn| clients::create(conn, &req, default_limit, OffsetDateTime::now_utc()))
        .await?;
    info!(client_id = %client.client_id, daily_limit = client.daily_limit, "client created");
    Ok((StatusCode::CREATED, Json(ClientView::from(&client))))
}

async fn api_clients_get(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> EngineResult<Json<ClientView>> {
    let client = state.db.call(move |conn| clients::require(conn, &client_id)).await?;
    Ok(Json(ClientView::from(&client)))
}

async fn api_clients_update(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<ClientUpdate>,
) -> EngineResult<Json<ClientView>> {
    let client = state
        .db
        .call(move |conn| clients::update(conn, &client_id, &req, OffsetDateTime::now_utc()))
        .await?;
    Ok(Json(ClientView::from(&client)))
}

#[derive(Deserialize)]
struct BonusReq {
    count: i64,
}

async fn api_add_bonus_plays(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<BonusReq>,
) -> EngineResult<Json<serde_json::Value>> {
    let now = OffsetDateTime::now_utc();
    let today = now.date();
    let client = state
        .db
        .call(move |conn| clients::grant_bonus(conn, &client_id, req.count, today, now))
        .await?;
    Ok(Json(json!({
        "client_id": client.client_id,
        "bonus_plays_count": client.bonus_plays_count,
        "effective_limit": client.effective_limit(today),
    })))
}

// --- Catalog ------------------------------------------------------------------

#[derive(Deserialize)]
struct VideosQuery {
    tags: Option<String>,
}

async fn api_videos_list(
    State(state): State<AppState>,
    Query(q): Query<VideosQuery>,
) -> EngineResult<Json<Vec<MediaItem>>> {
    let tag = q.tags.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty());
    let items = state
        .db
        .call(move |conn| catalog::list(conn, tag.as_deref()))
        .await?;
    Ok(Json(items))
}

async fn api_videos_scan(State(state): State<AppState>) -> EngineResult<Json<ScanReport>> {
    let report = scan_catalog(&state).await?;
    Ok(Json(report))
}

async fn api_videos_delete(
    State(state): State<AppState>,
    Path(video_id): Path<i64>,
) -> EngineResult<Json<serde_json::Value>> {
    let deleted = state.db.call(move |conn| catalog::delete(conn, video_id)).await?;
    if !deleted {
        return Err(EngineError::not_found("video", video_id));
    }
    info!(video_id, "video removed from catalog");
    Ok(Json(json!({ "ok": true })))
}

/// Sync the catalog with the configured media directory.
pub async fn scan_catalog(state: &AppState) -> EngineResult<ScanReport> {
    let media_dir = state.config.media_dir.clone();
    let opts = ScanOptions {
        ffprobe: state
            .config
            .probe_durations
            .then(|| state.config.ffprobe.clone()),
    };
    state
        .db
        .call(move |conn| catalog::sync_catalog(conn, &media_dir, &opts, OffsetDateTime::now_utc()))
        .await
}

async fn api_play_complete(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
) -> EngineResult<Json<serde_json::Value>> {
    state
        .db
        .call(move |conn| history::mark_completed(conn, record_id))
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// --- Stats --------------------------------------------------------------------

async fn api_stats(State(state): State<AppState>) -> EngineResult<Json<serde_json::Value>> {
    let today = OffsetDateTime::now_utc().date();
    let stats = state
        .db
        .call(move |conn| {
            Ok(json!({
                "total_videos": catalog::count(conn)?,
                "total_clients": clients::count(conn)?,
                "total_plays": history::count_total(conn, None)?,
                "plays_today": history::count_all_on_day(conn, today)?,
            }))
        })
        .await?;
    Ok(Json(stats))
}

#[derive(Serialize)]
struct RecentPlayView {
    id: i64,
    video_id: Option<i64>,
    video_title: Option<String>,
    played_at: String,
    completed: bool,
}

#[derive(Serialize)]
struct ClientStats {
    client_id: String,
    friendly_name: String,
    daily_limit: u32,
    effective_limit: u32,
    plays_today: u32,
    plays_remaining: u32,
    total_plays: u64,
    queue_size: u32,
    recent_plays: Vec<RecentPlayView>,
}

const RECENT_PLAYS: u32 = 10;

async fn api_client_stats(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> EngineResult<Json<ClientStats>> {
    let today = OffsetDateTime::now_utc().date();
    let stats = state
        .db
        .call(move |conn| {
            let client = clients::require(conn, &client_id)?;
            let plays_today = history::count_on_day(conn, &client_id, today)?;
            let effective_limit = client.effective_limit(today);

            let mut recent_plays = Vec::new();
            for r in history::recent(conn, &client_id, RECENT_PLAYS)? {
                let video_title = match r.media_item_id {
                    Some(id) => catalog::get(conn, id)?.map(|i| i.title),
                    None => None,
                };
                recent_plays.push(RecentPlayView {
                    id: r.id,
                    video_id: r.media_item_id,
                    video_title,
                    played_at: format_rfc3339(r.played_at),
                    completed: r.completed,
                });
            }

            Ok(ClientStats {
                plays_today,
                plays_remaining: effective_limit.saturating_sub(plays_today),
                effective_limit,
                daily_limit: client.daily_limit,
                total_plays: history::count_total(conn, Some(&client_id))?,
                queue_size: queue::count(conn, &client_id)?,
                recent_plays,
                friendly_name: client.friendly_name,
                client_id: client.client_id,
            })
        })
        .await?;
    Ok(Json(stats))
}
