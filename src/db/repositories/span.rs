//! Execution spans

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{
    format_ts, json_from_sql, json_to_sql, opt_ts_column, ts_column, Database, SpanKind, ThreadKey,
};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSpan {
    pub span_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub run_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub status: String,
    pub payload: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "span_id, endpoint_id, thread_id, run_id, kind, name, status, payload,
    started_at, ended_at, updated_at";

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<ExecutionSpan> {
    Ok(ExecutionSpan {
        span_id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        run_id: row.get(3)?,
        kind: SpanKind::normalize(&row.get::<_, String>(4)?),
        name: row.get(5)?,
        status: row.get(6)?,
        payload: json_from_sql(row.get(7)?),
        started_at: ts_column(row, 8)?,
        ended_at: opt_ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}

pub(crate) fn upsert_in(conn: &Connection, span: &ExecutionSpan) -> StoreResult<()> {
    let payload = json_to_sql(&span.payload)?;
    conn.execute(
        "INSERT INTO execution_spans (span_id, endpoint_id, thread_id, run_id, kind, name, status,
                payload, started_at, ended_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(span_id) DO UPDATE SET
            run_id = excluded.run_id,
            kind = excluded.kind,
            name = excluded.name,
            status = excluded.status,
            payload = excluded.payload,
            ended_at = excluded.ended_at,
            updated_at = excluded.updated_at
         WHERE execution_spans.endpoint_id = excluded.endpoint_id
           AND execution_spans.thread_id = excluded.thread_id",
        params![
            span.span_id,
            span.endpoint_id,
            span.thread_id,
            span.run_id,
            span.kind.as_str(),
            span.name,
            span.status,
            payload,
            format_ts(span.started_at),
            span.ended_at.map(format_ts),
            format_ts(span.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_all_in(conn: &Connection, key: &ThreadKey) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM execution_spans WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
    )?;
    Ok(deleted)
}

pub(crate) fn list_in(
    conn: &Connection,
    key: &ThreadKey,
    run_id: Option<&str>,
) -> StoreResult<Vec<ExecutionSpan>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM execution_spans
         WHERE endpoint_id = ?1 AND thread_id = ?2 AND (?3 IS NULL OR run_id = ?3)
         ORDER BY started_at ASC, span_id ASC",
        COLUMNS
    ))?;
    let spans = stmt
        .query_map(params![key.endpoint_id, key.thread_id, run_id], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(spans)
}

pub struct SpanRepository {
    db: Database,
}

impl SpanRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert by span id. A span id already owned by another thread is rejected.
    pub async fn upsert(&self, span: &ExecutionSpan) -> StoreResult<()> {
        ThreadKey::new(span.endpoint_id.clone(), span.thread_id.clone())?;
        if span.span_id.trim().is_empty() {
            return Err(StoreError::invalid("span_id is required"));
        }
        let conn = self.db.conn().await?;
        upsert_in(&conn, span)?;
        if conn.changes() == 0 {
            return Err(StoreError::invalid(format!(
                "span {} belongs to another thread",
                span.span_id
            )));
        }
        Ok(())
    }

    pub async fn list(&self, key: &ThreadKey, run_id: Option<&str>) -> StoreResult<Vec<ExecutionSpan>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        list_in(&conn, key, run_id)
    }
}
