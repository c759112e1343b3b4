use std::future::Future;
use std::time::Duration;

use rusqlite::{params, Connection, Row, TransactionBehavior};
use time::{Date, OffsetDateTime};
use tracing::{error, warn};

use crate::db::{day_bounds_ms, from_unix_ms, unix_ms, Db};
use crate::error::{EngineError, EngineResult};

/// Append-only log entry. Only `completed` is ever updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub id: i64,
    pub client_id: String,
    /// `None` once the media item has been removed from the catalog.
    pub media_item_id: Option<i64>,
    pub played_at: OffsetDateTime,
    pub completed: bool,
}

/// How hard `record_play_safe` tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed write. Zero means a single attempt.
    pub retries: u32,
    /// Sleep after the first failure; doubled after each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

const RECORD_COLUMNS: &str = "id, client_id, media_item_id, played_at_ms, completed";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PlayRecord> {
    Ok(PlayRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        media_item_id: row.get(2)?,
        played_at: from_unix_ms(row.get(3)?),
        completed: row.get::<_, i64>(4)? != 0,
    })
}

/// One write attempt in its own transaction. A failure rolls back.
pub fn record_play(
    conn: &mut Connection,
    client_id: &str,
    media_item_id: i64,
    played_at: OffsetDateTime,
) -> EngineResult<PlayRecord> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO play_records (client_id, media_item_id, played_at_ms, completed)
         VALUES (?1, ?2, ?3, 0)",
        params![client_id, media_item_id, unix_ms(played_at)],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(PlayRecord {
        id,
        client_id: client_id.to_string(),
        media_item_id: Some(media_item_id),
        played_at,
        completed: false,
    })
}

/// Run `op` once, then up to `policy.retries` more times with exponential
/// backoff between failures. Returns `None` once every attempt has failed.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let attempts = policy.retries.saturating_add(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Some(v),
            Err(e) if attempt < attempts => {
                let delay = policy.delay_after(attempt);
                warn!(attempt, max = attempts, ?delay, error = %e, "{what} failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(attempts, error = %e, "{what} failed; giving up");
            }
        }
    }
    None
}

/// Log a play without ever failing the caller. Store errors are retried per
/// `policy`; after the last attempt the play is dropped from the log and
/// `None` is returned.
pub async fn record_play_safe(
    db: &Db,
    policy: RetryPolicy,
    client_id: &str,
    media_item_id: i64,
    played_at: OffsetDateTime,
) -> Option<PlayRecord> {
    with_retry(policy, "play log write", || {
        let client_id = client_id.to_string();
        db.call(move |conn| record_play(conn, &client_id, media_item_id, played_at))
    })
    .await
}

pub fn count_on_day(conn: &Connection, client_id: &str, day: Date) -> EngineResult<u32> {
    let (start, end) = day_bounds_ms(day);
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM play_records
         WHERE client_id = ?1 AND played_at_ms >= ?2 AND played_at_ms < ?3",
        params![client_id, start, end],
        |row| row.get(0),
    )?;
    Ok(n as u32)
}

/// Plays across all clients on `day`.
pub fn count_all_on_day(conn: &Connection, day: Date) -> EngineResult<u64> {
    let (start, end) = day_bounds_ms(day);
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM play_records WHERE played_at_ms >= ?1 AND played_at_ms < ?2",
        params![start, end],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub fn count_total(conn: &Connection, client_id: Option<&str>) -> EngineResult<u64> {
    let n: i64 = match client_id {
        Some(id) => conn.query_row(
            "SELECT COUNT(*) FROM play_records WHERE client_id = ?1",
            params![id],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM play_records", [], |row| row.get(0))?,
    };
    Ok(n as u64)
}

/// Most recent first.
pub fn recent(conn: &Connection, client_id: &str, limit: u32) -> EngineResult<Vec<PlayRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM play_records WHERE client_id = ?1
         ORDER BY played_at_ms DESC, id DESC LIMIT ?2"
    ))?;
    let records = stmt
        .query_map(params![client_id, limit], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn mark_completed(conn: &Connection, record_id: i64) -> EngineResult<()> {
    let n = conn.execute(
        "UPDATE play_records SET completed = 1 WHERE id = ?1",
        params![record_id],
    )?;
    if n == 0 {
        return Err(EngineError::not_found("play record", record_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, NewMediaItem};
    use crate::db::testing::{temp_conn, temp_db};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use time::macros::datetime;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn counts_are_scoped_to_client_and_utc_day() {
        let (_dir, mut conn) = temp_conn();
        let item = catalog::insert(
            &conn,
            &NewMediaItem { path: "a.mp4".into(), title: "A".into(), ..Default::default() },
            datetime!(2026-10-17 8:00 UTC),
        )
        .unwrap();

        record_play(&mut conn, "kid", item.id, datetime!(2026-10-16 23:59:59 UTC)).unwrap();
        record_play(&mut conn, "kid", item.id, datetime!(2026-10-17 0:00 UTC)).unwrap();
        record_play(&mut conn, "kid", item.id, datetime!(2026-10-17 18:30 UTC)).unwrap();
        record_play(&mut conn, "other", item.id, datetime!(2026-10-17 9:00 UTC)).unwrap();

        let day = datetime!(2026-10-17 12:00 UTC).date();
        assert_eq!(count_on_day(&conn, "kid", day).unwrap(), 2);
        assert_eq!(count_on_day(&conn, "other", day).unwrap(), 1);
        assert_eq!(count_all_on_day(&conn, day).unwrap(), 3);
        assert_eq!(count_total(&conn, Some("kid")).unwrap(), 3);
        assert_eq!(count_total(&conn, None).unwrap(), 4);
    }

    #[test]
    fn recent_is_most_recent_first_and_completion_is_the_only_update() {
        let (_dir, mut conn) = temp_conn();
        let item = catalog::insert(
            &conn,
            &NewMediaItem { path: "a.mp4".into(), title: "A".into(), ..Default::default() },
            datetime!(2026-10-17 8:00 UTC),
        )
        .unwrap();
        let first = record_play(&mut conn, "kid", item.id, datetime!(2026-10-17 9:00 UTC)).unwrap();
        let second = record_play(&mut conn, "kid", item.id, datetime!(2026-10-17 10:00 UTC)).unwrap();

        mark_completed(&conn, first.id).unwrap();
        let recent = recent(&conn, "kid", 10).unwrap();
        assert_eq!(recent.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert!(recent[1].completed);
        assert!(!recent[0].completed);

        assert!(matches!(mark_completed(&conn, 9_999), Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn retry_makes_one_attempt_plus_configured_retries() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(10),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let started = std::time::Instant::now();
        let out: Option<()> = with_retry(policy, "test write", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Internal("store down".into()))
            }
        })
        .await;
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 ms: three backoffs, none after the last attempt.
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn zero_retries_is_a_single_attempt() {
        let policy = RetryPolicy {
            retries: 0,
            base_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let out: Option<()> = with_retry(policy, "test write", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Internal("store down".into()))
            }
        })
        .await;
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = with_retry(fast_policy(), "test write", || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    Err(EngineError::Internal("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Some(2));
    }

    #[tokio::test]
    async fn record_play_safe_swallows_permanent_store_failure() {
        let (_dir, db) = temp_db().await;
        db.call(|conn| {
            conn.execute_batch("DROP TABLE play_records;")?;
            Ok(())
        })
        .await
        .unwrap();

        let out = record_play_safe(&db, fast_policy(), "kid", 1, OffsetDateTime::now_utc()).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn record_play_safe_writes_when_store_is_healthy() {
        let (_dir, db) = temp_db().await;
        let item = db
            .call(|conn| {
                catalog::insert(
                    conn,
                    &NewMediaItem { path: "a.mp4".into(), title: "A".into(), ..Default::default() },
                    OffsetDateTime::now_utc(),
                )
            })
            .await
            .unwrap();

        let record = record_play_safe(&db, fast_policy(), "kid", item.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(record.media_item_id, Some(item.id));
        assert!(!record.completed);
    }
}
