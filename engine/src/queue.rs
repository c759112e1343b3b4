use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{from_unix_ms, unix_ms};
use crate::error::{EngineError, EngineResult};

/// One pending item in a client's queue. Positions are 1-based and
/// contiguous per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub client_id: String,
    pub media_item_id: i64,
    pub position: u32,
    pub created_at: OffsetDateTime,
}

const ENTRY_COLUMNS: &str = "id, client_id, media_item_id, position, created_at_ms";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let id_str: String = row.get(0)?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(QueueEntry {
        id,
        client_id: row.get(1)?,
        media_item_id: row.get(2)?,
        position: row.get::<_, i64>(3)? as u32,
        created_at: from_unix_ms(row.get(4)?),
    })
}

pub fn list(conn: &Connection, client_id: &str) -> EngineResult<Vec<QueueEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE client_id = ?1 ORDER BY position ASC"
    ))?;
    let entries = stmt
        .query_map(params![client_id], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn count(conn: &Connection, client_id: &str) -> EngineResult<u32> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_entries WHERE client_id = ?1",
        params![client_id],
        |row| row.get(0),
    )?;
    Ok(n as u32)
}

fn get(conn: &Connection, entry_id: Uuid) -> EngineResult<Option<QueueEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
            params![entry_id.to_string()],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

/// Add several items in order, all or nothing. With `start` the batch is
/// inserted as a block beginning at that position; otherwise it is appended.
pub fn enqueue(
    conn: &mut Connection,
    client_id: &str,
    media_item_ids: &[i64],
    start: Option<u32>,
    now: OffsetDateTime,
) -> EngineResult<Vec<QueueEntry>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut out = Vec::with_capacity(media_item_ids.len());
    for (i, id) in media_item_ids.iter().enumerate() {
        let position = start.map(|p| p.saturating_add(i as u32));
        out.push(enqueue_in(&tx, client_id, *id, position, now)?);
    }
    tx.commit()?;
    Ok(out)
}

fn enqueue_in(
    conn: &Connection,
    client_id: &str,
    media_item_id: i64,
    position: Option<u32>,
    now: OffsetDateTime,
) -> EngineResult<QueueEntry> {
    if crate::catalog::get(conn, media_item_id)?.is_none() {
        return Err(EngineError::not_found("video", media_item_id));
    }

    let tail = count(conn, client_id)? + 1;
    let position = match position {
        Some(0) => return Err(EngineError::Validation("queue positions start at 1".into())),
        Some(p) => p.min(tail),
        None => tail,
    };

    conn.execute(
        "UPDATE queue_entries SET position = position + 1
         WHERE client_id = ?1 AND position >= ?2",
        params![client_id, position],
    )?;

    let entry = QueueEntry {
        id: Uuid::new_v4(),
        client_id: client_id.to_string(),
        media_item_id,
        position,
        created_at: now,
    };
    conn.execute(
        "INSERT INTO queue_entries (id, client_id, media_item_id, position, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.id.to_string(),
            entry.client_id,
            entry.media_item_id,
            entry.position,
            unix_ms(now),
        ],
    )?;
    Ok(entry)
}

/// Claim the head of the client's queue: read the lowest position, delete it
/// and shift the rest up, in one write transaction. Two concurrent callers
/// for the same client can never receive the same entry.
pub fn dequeue_next(conn: &mut Connection, client_id: &str) -> EngineResult<Option<QueueEntry>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let head = tx
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE client_id = ?1
                 ORDER BY position ASC LIMIT 1"
            ),
            params![client_id],
            entry_from_row,
        )
        .optional()?;

    if let Some(entry) = &head {
        tx.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry.id.to_string()])?;
        tx.execute(
            "UPDATE queue_entries SET position = position - 1
             WHERE client_id = ?1 AND position > ?2",
            params![client_id, entry.position],
        )?;
    }

    tx.commit()?;
    Ok(head)
}

/// Remove one entry. An entry owned by another client is reported as not
/// found.
pub fn remove(conn: &mut Connection, client_id: &str, entry_id: Uuid) -> EngineResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let entry = get(&tx, entry_id)?
        .filter(|e| e.client_id == client_id)
        .ok_or_else(|| EngineError::not_found("queue entry", entry_id))?;

    tx.execute("DELETE FROM queue_entries WHERE id = ?1", params![entry_id.to_string()])?;
    tx.execute(
        "UPDATE queue_entries SET position = position - 1
         WHERE client_id = ?1 AND position > ?2",
        params![client_id, entry.position],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn clear(conn: &Connection, client_id: &str) -> EngineResult<u32> {
    let n = conn.execute("DELETE FROM queue_entries WHERE client_id = ?1", params![client_id])?;
    Ok(n as u32)
}

/// Rewrite positions to follow `ids_in_order`, which must name every entry
/// of the client exactly once. Any id that is not the client's rejects the
/// whole call with `OwnershipViolation`; nothing is changed on error.
pub fn reorder(conn: &mut Connection, client_id: &str, ids_in_order: &[Uuid]) -> EngineResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let owned: HashSet<Uuid> = list(&tx, client_id)?.into_iter().map(|e| e.id).collect();

    if let Some(foreign) = ids_in_order.iter().find(|id| !owned.contains(*id)) {
        return Err(EngineError::OwnershipViolation(format!(
            "queue entry {foreign} does not belong to client {client_id}"
        )));
    }

    let mut seen = HashSet::with_capacity(ids_in_order.len());
    if let Some(dup) = ids_in_order.iter().find(|id| !seen.insert(**id)) {
        return Err(EngineError::Validation(format!("queue entry {dup} listed twice")));
    }
    if seen.len() != owned.len() {
        return Err(EngineError::Validation(format!(
            "reorder needs all {} entries of client {client_id}, got {}",
            owned.len(),
            seen.len()
        )));
    }

    for (rank, id) in ids_in_order.iter().enumerate() {
        tx.execute(
            "UPDATE queue_entries SET position = ?1 WHERE id = ?2 AND client_id = ?3",
            params![rank as i64 + 1, id.to_string(), client_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Renumber a client's entries 1..N keeping their relative order.
pub(crate) fn compact_positions(conn: &Connection, client_id: &str) -> EngineResult<()> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM queue_entries WHERE client_id = ?1 ORDER BY position ASC, created_at_ms ASC",
        )?;
        let rows = stmt.query_map(params![client_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for (rank, id) in ids.iter().enumerate() {
        conn.execute(
            "UPDATE queue_entries SET position = ?1 WHERE id = ?2",
            params![rank as i64 + 1, id],
        )?;
    }
    Ok(())
}
