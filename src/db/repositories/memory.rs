//! Memory item repository

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{
    clamp_score, format_ts, ts_column, Database, MemoryKind, MemoryScope, ThreadKey,
};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub memory_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub scope: MemoryScope,
    pub kind: MemoryKind,
    pub content: String,
    pub importance: f64,
    pub freshness: f64,
    pub confidence: f64,
    pub source_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    pub fn key(&self) -> ThreadKey {
        ThreadKey {
            endpoint_id: self.endpoint_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

/// Optional filters for listing memory
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub scope: Option<MemoryScope>,
    pub kind: Option<MemoryKind>,
}

const COLUMNS: &str = "memory_id, endpoint_id, thread_id, scope, kind, content, importance,
    freshness, confidence, source_run_id, created_at, updated_at";

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<MemoryItem> {
    Ok(MemoryItem {
        memory_id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        scope: MemoryScope::normalize(&row.get::<_, String>(3)?),
        kind: MemoryKind::normalize(&row.get::<_, String>(4)?),
        content: row.get(5)?,
        importance: row.get(6)?,
        freshness: row.get(7)?,
        confidence: row.get(8)?,
        source_run_id: row.get(9)?,
        created_at: ts_column(row, 10)?,
        updated_at: ts_column(row, 11)?,
    })
}

/// Insert or update by memory id. `created_at` of an existing row is kept.
pub(crate) fn upsert_in(conn: &Connection, item: &MemoryItem) -> StoreResult<()> {
    if item.memory_id.trim().is_empty() {
        return Err(StoreError::invalid("memory_id is required"));
    }
    conn.execute(
        "INSERT INTO memory_items (memory_id, endpoint_id, thread_id, scope, kind, content,
                importance, freshness, confidence, source_run_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(endpoint_id, thread_id, memory_id) DO UPDATE SET
            scope = excluded.scope,
            kind = excluded.kind,
            content = excluded.content,
            importance = excluded.importance,
            freshness = excluded.freshness,
            confidence = excluded.confidence,
            source_run_id = excluded.source_run_id,
            updated_at = excluded.updated_at",
        params![
            item.memory_id,
            item.endpoint_id,
            item.thread_id,
            item.scope.as_str(),
            item.kind.as_str(),
            item.content,
            clamp_score(item.importance),
            clamp_score(item.freshness),
            clamp_score(item.confidence),
            item.source_run_id,
            format_ts(item.created_at),
            format_ts(item.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_in(conn: &Connection, key: &ThreadKey, memory_id: &str) -> StoreResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM memory_items WHERE endpoint_id = ?1 AND thread_id = ?2 AND memory_id = ?3",
        params![key.endpoint_id, key.thread_id, memory_id],
    )?;
    Ok(deleted > 0)
}

pub(crate) fn delete_all_in(conn: &Connection, key: &ThreadKey) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM memory_items WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
    )?;
    Ok(deleted)
}

pub(crate) fn list_in(
    conn: &Connection,
    key: &ThreadKey,
    filter: &MemoryFilter,
) -> StoreResult<Vec<MemoryItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM memory_items
         WHERE endpoint_id = ?1 AND thread_id = ?2
           AND (?3 IS NULL OR scope = ?3)
           AND (?4 IS NULL OR kind = ?4)
         ORDER BY importance DESC, memory_id ASC",
        COLUMNS
    ))?;
    let items = stmt
        .query_map(
            params![
                key.endpoint_id,
                key.thread_id,
                filter.scope.map(|s| s.as_str()),
                filter.kind.map(|k| k.as_str()),
            ],
            map_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Deletions first, then upserts. Returns (upserted, deleted).
pub(crate) fn apply_in(
    conn: &Connection,
    key: &ThreadKey,
    upserts: &[MemoryItem],
    deletes: &[String],
) -> StoreResult<(usize, usize)> {
    if let Some(stray) = upserts.iter().find(|item| &item.key() != key) {
        return Err(StoreError::invalid(format!(
            "memory item {} belongs to another thread",
            stray.memory_id
        )));
    }
    let mut deleted = 0;
    for memory_id in deletes {
        if delete_in(conn, key, memory_id)? {
            deleted += 1;
        }
    }
    for item in upserts {
        upsert_in(conn, item)?;
    }
    Ok((upserts.len(), deleted))
}

pub struct MemoryRepository {
    db: Database,
}

impl MemoryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, item: &MemoryItem) -> StoreResult<()> {
        item.key().validate()?;
        let conn = self.db.conn().await?;
        upsert_in(&conn, item)
    }

    /// Delete one item; returns false if it did not exist
    pub async fn delete(&self, key: &ThreadKey, memory_id: &str) -> StoreResult<bool> {
        key.validate()?;
        let conn = self.db.conn().await?;
        delete_in(&conn, key, memory_id)
    }

    pub async fn list(&self, key: &ThreadKey, filter: &MemoryFilter) -> StoreResult<Vec<MemoryItem>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        list_in(&conn, key, filter)
    }

    /// Apply upserts and deletions atomically. Returns (upserted, deleted).
    pub async fn apply(
        &self,
        key: &ThreadKey,
        upserts: &[MemoryItem],
        deletes: &[String],
    ) -> StoreResult<(usize, usize)> {
        key.validate()?;
        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;
        let counts = apply_in(&tx, key, upserts, deletes)?;
        tx.commit()?;
        Ok(counts)
    }
}
