// --- Persistence (SQLite) -------------------------------------------------
//
// One file, WAL mode, one short-lived connection per operation. rusqlite is
// synchronous, so async callers go through `Db::call`, which runs the closure
// on the blocking pool.
//
// Every multi-statement mutation runs inside a transaction so the per-client
// queue positions stay contiguous at every observable instant.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use time::{Date, OffsetDateTime};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a connection with the per-connection pragmas applied.
    pub fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Create the schema if it does not exist yet.
    pub async fn init(&self) -> EngineResult<()> {
        self.call(|conn| {
            db_init(conn)?;
            Ok(())
        })
        .await
    }

    /// Run `f` against a fresh connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.open()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("failed to join sqlite task: {e}")))?
    }
}

pub fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS media_items (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            path          TEXT NOT NULL UNIQUE,
            title         TEXT NOT NULL,
            tags          TEXT NOT NULL DEFAULT '',
            duration_secs INTEGER,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clients (
            client_id         TEXT PRIMARY KEY,
            friendly_name     TEXT NOT NULL,
            daily_limit       INTEGER NOT NULL CHECK (daily_limit > 0),
            bonus_plays_count INTEGER NOT NULL DEFAULT 0,
            bonus_plays_date  TEXT,
            tag_filters       TEXT NOT NULL DEFAULT '',
            created_at_ms     INTEGER NOT NULL,
            updated_at_ms     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_entries (
            id            TEXT PRIMARY KEY,
            client_id     TEXT NOT NULL,
            media_item_id INTEGER NOT NULL REFERENCES media_items(id) ON DELETE CASCADE,
            position      INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_queue_entries_client_position
            ON queue_entries(client_id, position);

        CREATE TABLE IF NOT EXISTS play_records (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id     TEXT NOT NULL,
            media_item_id INTEGER REFERENCES media_items(id) ON DELETE SET NULL,
            played_at_ms  INTEGER NOT NULL,
            completed     INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_play_records_client_played
            ON play_records(client_id, played_at_ms);
        "#,
    )
}

// --- Time helpers -----------------------------------------------------------
//
// Timestamps are stored as unix milliseconds (UTC). Days are UTC calendar days.

pub fn unix_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_unix_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Half-open `[start, end)` range of a UTC day in unix milliseconds.
pub fn day_bounds_ms(day: Date) -> (i64, i64) {
    let start = day.midnight().assume_utc();
    let end = start + time::Duration::days(1);
    (unix_ms(start), unix_ms(end))
}

pub fn format_day(day: Date) -> String {
    format!("{:04}-{:02}-{:02}", day.year(), u8::from(day.month()), day.day())
}

pub fn parse_day(s: &str) -> Option<Date> {
    Date::parse(s.trim(), time::macros::format_description!("[year]-[month]-[day]")).ok()
}

pub fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| t.unix_timestamp().to_string())
}
