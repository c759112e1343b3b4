use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::unix_ms;
use crate::error::{EngineError, EngineResult};

/// File extensions the scanner treats as playable video.
const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "avi", "mov"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaItem {
    pub id: i64,
    /// Path relative to the media directory, `/`-separated.
    pub path: String,
    pub title: String,
    pub tags: BTreeSet<String>,
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMediaItem {
    pub path: String,
    pub title: String,
    pub tags: BTreeSet<String>,
    pub duration_secs: Option<u32>,
}

const ITEM_COLUMNS: &str = "id, path, title, tags, duration_secs";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<MediaItem> {
    let tags: String = row.get(3)?;
    Ok(MediaItem {
        id: row.get(0)?,
        path: row.get(1)?,
        title: row.get(2)?,
        tags: split_tags(&tags),
        duration_secs: row.get::<_, Option<i64>>(4)?.map(|d| d as u32),
    })
}

fn split_tags(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_tags(tags: &BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

// --- ContentRepository ------------------------------------------------------

pub fn get(conn: &Connection, id: i64) -> EngineResult<Option<MediaItem>> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM media_items WHERE id = ?1"),
            params![id],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

pub fn get_by_path(conn: &Connection, path: &str) -> EngineResult<Option<MediaItem>> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM media_items WHERE path = ?1"),
            params![path],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

/// All items sorted by title, optionally narrowed to those carrying `tag`.
pub fn list(conn: &Connection, tag: Option<&str>) -> EngineResult<Vec<MediaItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM media_items ORDER BY title COLLATE NOCASE ASC, id ASC"
    ))?;
    let items = stmt
        .query_map([], item_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(match tag.map(str::trim).filter(|t| !t.is_empty()) {
        Some(tag) => items.into_iter().filter(|it| it.tags.contains(tag)).collect(),
        None => items,
    })
}

pub fn count(conn: &Connection) -> EngineResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM media_items", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Uniform random pick over the whole catalog. Repeats across calls are
/// allowed; there is no recently-played window.
pub fn random(conn: &Connection) -> EngineResult<Option<MediaItem>> {
    let n = count(conn)?;
    if n == 0 {
        return Ok(None);
    }
    let offset = fastrand::u64(..n) as i64;
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM media_items ORDER BY id LIMIT 1 OFFSET ?1"),
            params![offset],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

pub fn insert(conn: &Connection, item: &NewMediaItem, now: OffsetDateTime) -> EngineResult<MediaItem> {
    if item.path.trim().is_empty() {
        return Err(EngineError::Validation("media path is empty".into()));
    }
    if get_by_path(conn, &item.path)?.is_some() {
        return Err(EngineError::Conflict(format!("media item {} already exists", item.path)));
    }
    conn.execute(
        "INSERT INTO media_items (path, title, tags, duration_secs, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            item.path,
            item.title,
            join_tags(&item.tags),
            item.duration_secs.map(i64::from),
            unix_ms(now),
        ],
    )?;
    Ok(MediaItem {
        id: conn.last_insert_rowid(),
        path: item.path.clone(),
        title: item.title.clone(),
        tags: item.tags.clone(),
        duration_secs: item.duration_secs,
    })
}

/// Delete an item. Queue entries pointing at it are removed (and the affected
/// queues re-compacted); play records keep their row with a NULL reference.
pub fn delete(conn: &mut Connection, id: i64) -> EngineResult<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let deleted = delete_in(&tx, id)?;
    tx.commit()?;
    Ok(deleted)
}

fn delete_in(conn: &Connection, id: i64) -> EngineResult<bool> {
    let clients: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT DISTINCT client_id FROM queue_entries WHERE media_item_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    // Explicit rather than relying on the FK actions alone, so older files
    // created without foreign keys behave the same.
    conn.execute("DELETE FROM queue_entries WHERE media_item_id = ?1", params![id])?;
    conn.execute(
        "UPDATE play_records SET media_item_id = NULL WHERE media_item_id = ?1",
        params![id],
    )?;
    let n = conn.execute("DELETE FROM media_items WHERE id = ?1", params![id])?;

    for client_id in &clients {
        crate::queue::compact_positions(conn, client_id)?;
    }
    Ok(n > 0)
}

// --- Scanner ----------------------------------------------------------------

/// Recursively collect video files under `dir`, returned as `/`-separated
/// paths relative to `dir`, sorted.
pub fn scan_video_files(dir: &Path) -> EngineResult<Vec<String>> {
    if !dir.is_dir() {
        return Err(EngineError::Validation(format!(
            "media dir does not exist: {}",
            dir.display()
        )));
    }

    // Filesystem errors are reported, not treated as an empty directory.
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let rd = std::fs::read_dir(&path).map_err(|e| {
            EngineError::Internal(format!("failed to read_dir({}): {e}", path.display()))
        })?;
        for ent in rd {
            let ent = ent.map_err(|e| EngineError::Internal(format!("failed to read_dir entry: {e}")))?;
            let p = ent.path();
            if p.is_dir() {
                stack.push(p);
                continue;
            }
            if !p.is_file() {
                continue;
            }

            let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let ext_lc = ext.to_ascii_lowercase();
            if !VIDEO_EXTENSIONS.contains(&ext_lc.as_str()) {
                continue;
            }

            let Ok(rel) = p.strip_prefix(dir) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }

    out.sort();
    Ok(out)
}

/// "cartoons/peppa_pig-s01.mp4" -> "Peppa Pig S01"
pub fn title_from_path(p: &str) -> String {
    let stem = Path::new(p)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown");

    stem.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// The parent directory name becomes the item's tag; top-level files have none.
pub fn tags_from_path(p: &str) -> BTreeSet<String> {
    Path::new(p)
        .parent()
        .and_then(|d| d.file_name())
        .and_then(|d| d.to_str())
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .into_iter()
        .collect()
}

pub fn probe_duration_seconds(ffprobe: &str, path: &Path) -> Option<u32> {
    use std::process::Command;

    let out = Command::new(ffprobe)
        .arg("-v").arg("error")
        .arg("-show_entries").arg("format=duration")
        .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .ok()?;

    if !out.status.success() {
        return None;
    }

    let s = String::from_utf8_lossy(&out.stdout);
    let secs_f: f64 = s.trim().parse().ok()?;
    if !secs_f.is_finite() || secs_f <= 0.0 {
        return None;
    }

    Some(secs_f.round() as u32)
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// `Some(binary)` to run ffprobe on newly added files.
    pub ffprobe: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub total_found: u32,
    pub added: u32,
    pub skipped: u32,
    pub removed: u32,
}

/// Reconcile the catalog with what is on disk under `media_dir`: add new
/// files, leave known ones alone, delete items whose file vanished.
pub fn sync_catalog(
    conn: &mut Connection,
    media_dir: &Path,
    opts: &ScanOptions,
    now: OffsetDateTime,
) -> EngineResult<ScanReport> {
    // Scan before touching the DB so a missing directory removes nothing.
    let files = scan_video_files(media_dir)?;
    let on_disk: HashSet<&str> = files.iter().map(String::as_str).collect();

    let mut report = ScanReport {
        total_found: files.len() as u32,
        ..ScanReport::default()
    };

    // Probe outside the write transaction; ffprobe can take seconds per file.
    let mut additions = Vec::new();
    for rel in &files {
        if get_by_path(conn, rel)?.is_some() {
            report.skipped += 1;
            continue;
        }
        let duration_secs = opts
            .ffprobe
            .as_deref()
            .and_then(|bin| probe_duration_seconds(bin, &media_dir.join(rel)));
        additions.push(NewMediaItem {
            path: rel.clone(),
            title: title_from_path(rel),
            tags: tags_from_path(rel),
            duration_secs,
        });
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for item in &additions {
        // Another scan may have added it while we were probing.
        if get_by_path(&tx, &item.path)?.is_some() {
            report.skipped += 1;
            continue;
        }
        insert(&tx, item, now)?;
        report.added += 1;
    }

    let known: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT id, path FROM media_items")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for (id, path) in known {
        if !on_disk.contains(path.as_str()) {
            warn!(media_item_id = id, %path, "media file vanished; removing from catalog");
            delete_in(&tx, id)?;
            report.removed += 1;
        }
    }

    tx.commit()?;

    info!(
        dir = %media_dir.display(),
        found = report.total_found,
        added = report.added,
        skipped = report.skipped,
        removed = report.removed,
        "catalog scan complete"
    );
    Ok(report)
}
