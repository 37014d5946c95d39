//! Context snapshots (append-only compression artifacts)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{clamp_score, format_ts, ts_column, ContextLevel, Database, ThreadKey};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    pub snapshot_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub level: ContextLevel,
    pub summary: String,
    pub quality_score: f64,
    pub turn_start: Option<i64>,
    pub turn_end: Option<i64>,
    pub created_at: DateTime<Utc>,
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<ContextSnapshot> {
    Ok(ContextSnapshot {
        snapshot_id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        level: ContextLevel::normalize(&row.get::<_, String>(3)?),
        summary: row.get(4)?,
        quality_score: row.get(5)?,
        turn_start: row.get(6)?,
        turn_end: row.get(7)?,
        created_at: ts_column(row, 8)?,
    })
}

/// Insert a snapshot; an existing id is left untouched. Returns true if inserted.
pub(crate) fn insert_in(conn: &Connection, snapshot: &ContextSnapshot) -> StoreResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO context_snapshots (snapshot_id, endpoint_id, thread_id, level, summary,
                quality_score, turn_start, turn_end, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            snapshot.snapshot_id,
            snapshot.endpoint_id,
            snapshot.thread_id,
            snapshot.level.as_str(),
            snapshot.summary,
            clamp_score(snapshot.quality_score),
            snapshot.turn_start,
            snapshot.turn_end,
            format_ts(snapshot.created_at),
        ],
    )?;
    Ok(inserted > 0)
}

pub(crate) fn delete_all_in(conn: &Connection, key: &ThreadKey) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM context_snapshots WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
    )?;
    Ok(deleted)
}

pub(crate) fn list_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Vec<ContextSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT snapshot_id, endpoint_id, thread_id, level, summary, quality_score, turn_start, turn_end, created_at
         FROM context_snapshots WHERE endpoint_id = ?1 AND thread_id = ?2
         ORDER BY created_at ASC, snapshot_id ASC",
    )?;
    let snapshots = stmt
        .query_map(params![key.endpoint_id, key.thread_id], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(snapshots)
}

pub struct ContextRepository {
    db: Database,
}

impl ContextRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, snapshot: &ContextSnapshot) -> StoreResult<bool> {
        ThreadKey::new(snapshot.endpoint_id.clone(), snapshot.thread_id.clone())?;
        if snapshot.snapshot_id.trim().is_empty() {
            return Err(StoreError::invalid("snapshot_id is required"));
        }
        if let (Some(start), Some(end)) = (snapshot.turn_start, snapshot.turn_end) {
            if start > end {
                return Err(StoreError::invalid("turn_start must not exceed turn_end"));
            }
        }
        let conn = self.db.conn().await?;
        insert_in(&conn, snapshot)
    }

    pub async fn list(&self, key: &ThreadKey) -> StoreResult<Vec<ContextSnapshot>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        list_in(&conn, key)
    }
}
