use std::collections::BTreeSet;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::info;

use crate::db::{format_day, from_unix_ms, parse_day, unix_ms};
use crate::error::{EngineError, EngineResult};

/// Per-device settings: daily limit plus a bonus grant that only counts on
/// the day it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub client_id: String,
    pub friendly_name: String,
    pub daily_limit: u32,
    pub bonus_plays_count: u32,
    pub bonus_plays_date: Option<Date>,
    pub tag_filters: BTreeSet<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ClientProfile {
    /// `daily_limit` plus the bonus, if the bonus was granted on `day`.
    pub fn effective_limit(&self, day: Date) -> u32 {
        let bonus = match self.bonus_plays_date {
            Some(d) if d == day => self.bonus_plays_count,
            _ => 0,
        };
        self.daily_limit.saturating_add(bonus)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewClient {
    pub client_id: String,
    pub friendly_name: String,
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub tag_filters: Option<Vec<String>>,
}

/// Partial update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientUpdate {
    pub friendly_name: Option<String>,
    pub daily_limit: Option<i64>,
    pub tag_filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientView {
    pub client_id: String,
    pub friendly_name: String,
    pub daily_limit: u32,
    pub bonus_plays_count: u32,
    pub bonus_plays_date: Option<String>,
    pub tag_filters: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&ClientProfile> for ClientView {
    fn from(p: &ClientProfile) -> Self {
        Self {
            client_id: p.client_id.clone(),
            friendly_name: p.friendly_name.clone(),
            daily_limit: p.daily_limit,
            bonus_plays_count: p.bonus_plays_count,
            bonus_plays_date: p.bonus_plays_date.map(format_day),
            tag_filters: p.tag_filters.iter().cloned().collect(),
            created_at: crate::db::format_rfc3339(p.created_at),
            updated_at: crate::db::format_rfc3339(p.updated_at),
        }
    }
}

const CLIENT_COLUMNS: &str = "client_id, friendly_name, daily_limit, bonus_plays_count, \
     bonus_plays_date, tag_filters, created_at_ms, updated_at_ms";

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientProfile> {
    let date: Option<String> = row.get(4)?;
    let filters: String = row.get(5)?;
    Ok(ClientProfile {
        client_id: row.get(0)?,
        friendly_name: row.get(1)?,
        daily_limit: row.get::<_, i64>(2)? as u32,
        bonus_plays_count: row.get::<_, i64>(3)?.max(0) as u32,
        bonus_plays_date: date.as_deref().and_then(parse_day),
        tag_filters: filters
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        created_at: from_unix_ms(row.get(6)?),
        updated_at: from_unix_ms(row.get(7)?),
    })
}

fn validate_limit(limit: i64) -> EngineResult<u32> {
    if limit <= 0 || limit > u32::MAX as i64 {
        return Err(EngineError::Validation(format!(
            "daily_limit must be a positive integer, got {limit}"
        )));
    }
    Ok(limit as u32)
}

fn join_filters(filters: &[String]) -> String {
    filters
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",")
}

pub fn get(conn: &Connection, client_id: &str) -> EngineResult<Option<ClientProfile>> {
    let client = conn
        .query_row(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = ?1"),
            params![client_id],
            client_from_row,
        )
        .optional()?;
    Ok(client)
}

pub fn require(conn: &Connection, client_id: &str) -> EngineResult<ClientProfile> {
    get(conn, client_id)?.ok_or_else(|| EngineError::not_found("client", client_id))
}

/// All clients sorted by id.
pub fn list(conn: &Connection) -> EngineResult<Vec<ClientProfile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY client_id ASC"
    ))?;
    let clients = stmt
        .query_map([], client_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(clients)
}

pub fn count(conn: &Connection) -> EngineResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
    Ok(n as u64)
}

pub fn create(
    conn: &Connection,
    new: &NewClient,
    default_limit: u32,
    now: OffsetDateTime,
) -> EngineResult<ClientProfile> {
    let client_id = new.client_id.trim();
    if client_id.is_empty() {
        return Err(EngineError::Validation("client_id is required".into()));
    }
    if new.friendly_name.trim().is_empty() {
        return Err(EngineError::Validation("friendly_name is required".into()));
    }
    let daily_limit = match new.daily_limit {
        Some(l) => validate_limit(l)?,
        None => default_limit,
    };
    // The primary key decides between racing creates; the loser gets Conflict.
    let inserted = conn.execute(
        "INSERT INTO clients (client_id, friendly_name, daily_limit, bonus_plays_count,
                              bonus_plays_date, tag_filters, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, 0, NULL, ?4, ?5, ?5)",
        params![
            client_id,
            new.friendly_name.trim(),
            daily_limit,
            join_filters(new.tag_filters.as_deref().unwrap_or_default()),
            unix_ms(now),
        ],
    );
    match inserted {
        Ok(_) => require(conn, client_id),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(EngineError::Conflict(format!("client {client_id} already exists")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Fetch the profile, provisioning it with `default_limit` and a generated
/// name on first contact.
pub fn get_or_create(
    conn: &Connection,
    client_id: &str,
    default_limit: u32,
    now: OffsetDateTime,
) -> EngineResult<ClientProfile> {
    if let Some(client) = get(conn, client_id)? {
        return Ok(client);
    }
    // INSERT OR IGNORE so two first requests racing for the same id both
    // end up reading the one row.
    conn.execute(
        "INSERT OR IGNORE INTO clients (client_id, friendly_name, daily_limit, bonus_plays_count,
                                        bonus_plays_date, tag_filters, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, 0, NULL, '', ?4, ?4)",
        params![client_id, format!("Client {client_id}"), default_limit, unix_ms(now)],
    )?;
    info!(client_id, daily_limit = default_limit, "auto-provisioned client profile");
    require(conn, client_id)
}

pub fn update(
    conn: &Connection,
    client_id: &str,
    upd: &ClientUpdate,
    now: OffsetDateTime,
) -> EngineResult<ClientProfile> {
    let mut client = require(conn, client_id)?;

    if let Some(name) = &upd.friendly_name {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("friendly_name cannot be empty".into()));
        }
        client.friendly_name = name.trim().to_string();
    }
    if let Some(limit) = upd.daily_limit {
        client.daily_limit = validate_limit(limit)?;
    }
    let filters = match &upd.tag_filters {
        Some(f) => join_filters(f),
        None => client.tag_filters.iter().cloned().collect::<Vec<_>>().join(","),
    };

    conn.execute(
        "UPDATE clients SET friendly_name = ?1, daily_limit = ?2, tag_filters = ?3, updated_at_ms = ?4
         WHERE client_id = ?5",
        params![client.friendly_name, client.daily_limit, filters, unix_ms(now), client_id],
    )?;
    require(conn, client_id)
}

/// Grant `count` extra plays for `day`. A second grant on the same day adds
/// to the first; a grant on a new day replaces the stale one.
pub fn grant_bonus(
    conn: &Connection,
    client_id: &str,
    count: i64,
    day: Date,
    now: OffsetDateTime,
) -> EngineResult<ClientProfile> {
    if count <= 0 || count > u32::MAX as i64 {
        return Err(EngineError::Validation(format!(
            "bonus count must be a positive integer, got {count}"
        )));
    }
    // One statement, so concurrent grants on the same day all add up.
    let n = conn.execute(
        "UPDATE clients
         SET bonus_plays_count = CASE WHEN bonus_plays_date = ?1
                                      THEN bonus_plays_count + ?2 ELSE ?2 END,
             bonus_plays_date = ?1,
             updated_at_ms = ?3
         WHERE client_id = ?4",
        params![format_day(day), count, unix_ms(now), client_id],
    )?;
    if n == 0 {
        return Err(EngineError::not_found("client", client_id));
    }
    let client = require(conn, client_id)?;
    info!(
        client_id,
        granted = count,
        bonus_today = client.bonus_plays_count,
        "bonus plays granted"
    );
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_conn;
    use crate::db::Db;
    use time::macros::{date, datetime};

    const NOW: OffsetDateTime = datetime!(2026-10-17 9:00 UTC);

    fn new_client(id: &str, limit: Option<i64>) -> NewClient {
        NewClient {
            client_id: id.into(),
            friendly_name: format!("Kid {id}"),
            daily_limit: limit,
            tag_filters: None,
        }
    }

    #[test]
    fn effective_limit_only_counts_same_day_bonus() {
        let (_dir, conn) = temp_conn();
        create(&conn, &new_client("kid", Some(2)), 3, NOW).unwrap();
        let day = date!(2026 - 10 - 17);

        let p = grant_bonus(&conn, "kid", 3, day, NOW).unwrap();
        assert_eq!(p.effective_limit(day), 5);
        assert_eq!(p.effective_limit(date!(2026 - 10 - 18)), 2);
        assert_eq!(p.effective_limit(date!(2026 - 10 - 16)), 2);
    }

    #[test]
    fn same_day_grants_accumulate_and_new_day_replaces() {
        let (_dir, conn) = temp_conn();
        create(&conn, &new_client("kid", Some(2)), 3, NOW).unwrap();
        let day = date!(2026 - 10 - 17);

        grant_bonus(&conn, "kid", 1, day, NOW).unwrap();
        let p = grant_bonus(&conn, "kid", 2, day, NOW).unwrap();
        assert_eq!(p.bonus_plays_count, 3);

        let next = date!(2026 - 10 - 18);
        let p = grant_bonus(&conn, "kid", 1, next, NOW).unwrap();
        assert_eq!(p.bonus_plays_count, 1);
        assert_eq!(p.bonus_plays_date, Some(next));
        assert_eq!(p.effective_limit(day), 2);
    }

    #[test]
    fn bonus_rejects_non_positive_and_unknown_client() {
        let (_dir, conn) = temp_conn();
        create(&conn, &new_client("kid", None), 3, NOW).unwrap();
        let day = date!(2026 - 10 - 17);

        assert!(matches!(grant_bonus(&conn, "kid", 0, day, NOW), Err(EngineError::Validation(_))));
        assert!(matches!(grant_bonus(&conn, "kid", -2, day, NOW), Err(EngineError::Validation(_))));
        assert!(matches!(grant_bonus(&conn, "nobody", 1, day, NOW), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn create_validates_and_rejects_duplicates() {
        let (_dir, conn) = temp_conn();
        let p = create(&conn, &new_client("kid", None), 3, NOW).unwrap();
        assert_eq!(p.daily_limit, 3);

        assert!(matches!(
            create(&conn, &new_client("kid", None), 3, NOW),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            create(&conn, &new_client("neg", Some(-1)), 3, NOW),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            create(&conn, &new_client("zero", Some(0)), 3, NOW),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn concurrent_same_day_grants_all_count() {
        let (dir, conn) = temp_conn();
        create(&conn, &new_client("kid", Some(2)), 3, NOW).unwrap();
        let db = Db::new(dir.path().join("test.db"));
        let day = date!(2026 - 10 - 17);

        let grants: Vec<_> = (0..16)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || grant_bonus(&db.open().unwrap(), "kid", 1, day, NOW).is_ok())
            })
            .collect();
        for g in grants {
            assert!(g.join().unwrap());
        }

        let p = require(&conn, "kid").unwrap();
        assert_eq!(p.bonus_plays_count, 16);
        assert_eq!(p.effective_limit(day), 18);
    }

    #[test]
    fn racing_creates_yield_one_client_and_conflicts() {
        let (dir, _conn) = temp_conn();
        let db = Db::new(dir.path().join("test.db"));

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || create(&db.open().unwrap(), &new_client("kid", None), 3, NOW))
            })
            .collect();
        let results: Vec<_> = attempts.into_iter().map(|a| a.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::Conflict(_))));
    }

    #[test]
    fn get_or_create_provisions_once() {
        let (_dir, conn) = temp_conn();
        let p = get_or_create(&conn, "new-kid", 4, NOW).unwrap();
        assert_eq!(p.friendly_name, "Client new-kid");
        assert_eq!(p.daily_limit, 4);

        update(&conn, "new-kid", &ClientUpdate { daily_limit: Some(7), ..Default::default() }, NOW).unwrap();
        let again = get_or_create(&conn, "new-kid", 4, NOW).unwrap();
        assert_eq!(again.daily_limit, 7);
        assert_eq!(count(&conn).unwrap(), 1);
    }

    #[test]
    fn update_is_partial_and_bumps_timestamp() {
        let (_dir, conn) = temp_conn();
        create(&conn, &new_client("kid", Some(2)), 3, NOW).unwrap();

        let later = datetime!(2026-10-17 10:00 UTC);
        let p = update(
            &conn,
            "kid",
            &ClientUpdate {
                tag_filters: Some(vec!["cartoons".into(), " educational ".into()]),
                ..Default::default()
            },
            later,
        )
        .unwrap();
        assert_eq!(p.friendly_name, "Kid kid");
        assert_eq!(p.daily_limit, 2);
        assert_eq!(p.tag_filters.len(), 2);
        assert!(p.updated_at > p.created_at);

        assert!(matches!(
            update(&conn, "kid", &ClientUpdate { daily_limit: Some(0), ..Default::default() }, later),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            update(&conn, "ghost", &ClientUpdate::default(), later),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let (_dir, conn) = temp_conn();
        for id in ["b", "c", "a"] {
            create(&conn, &new_client(id, None), 3, NOW).unwrap();
        }
        let ids: Vec<_> = list(&conn).unwrap().into_iter().map(|c| c.client_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
