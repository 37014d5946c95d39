//! Runs, tool calls and run events

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{
    format_ts, json_from_sql, json_to_sql, now, ts_column, Database, RunState, ThreadKey,
    ToolCallStatus,
};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub state: RunState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attempt: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: i64,
    pub run_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub args: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub retryable: bool,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write side of a tool call; the row id and timestamps are assigned by the store
#[derive(Debug, Clone)]
pub struct ToolCallUpdate {
    pub run_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub args: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub retryable: bool,
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub stream: String,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

const RUN_COLUMNS: &str =
    "run_id, endpoint_id, thread_id, state, error_code, error_message, attempt, created_at, updated_at";

fn map_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    Ok(Run {
        run_id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        state: RunState::normalize(&row.get::<_, String>(3)?),
        error_code: row.get(4)?,
        error_message: row.get(5)?,
        attempt: row.get(6)?,
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
    })
}

fn map_tool_call(row: &rusqlite::Row) -> rusqlite::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        tool_id: row.get(2)?,
        tool_name: row.get(3)?,
        status: ToolCallStatus::normalize(&row.get::<_, String>(4)?),
        args: json_from_sql(row.get(5)?),
        result: json_from_sql(row.get(6)?),
        retryable: row.get(7)?,
        latency_ms: row.get(8)?,
        created_at: ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<RunEvent> {
    Ok(RunEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        endpoint_id: row.get(2)?,
        thread_id: row.get(3)?,
        stream: row.get(4)?,
        event_type: row.get(5)?,
        payload: json_from_sql(row.get(6)?),
        created_at: ts_column(row, 7)?,
    })
}

pub(crate) fn get_run_in(conn: &Connection, run_id: &str) -> StoreResult<Option<Run>> {
    let run = conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
            params![run_id],
            map_run,
        )
        .optional()?;
    Ok(run)
}

pub(crate) fn list_run_ids_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT run_id FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2 ORDER BY created_at, run_id",
    )?;
    let ids = stmt
        .query_map(params![key.endpoint_id, key.thread_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub(crate) fn list_runs_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2 ORDER BY created_at, run_id",
        RUN_COLUMNS
    ))?;
    let runs = stmt
        .query_map(params![key.endpoint_id, key.thread_id], map_run)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}

/// Write a captured run row back exactly as it was
pub(crate) fn put_run_exact_in(conn: &Connection, run: &Run) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO runs (run_id, endpoint_id, thread_id, state, error_code, error_message, attempt, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            error_code = excluded.error_code,
            error_message = excluded.error_message,
            attempt = excluded.attempt,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at
         WHERE runs.endpoint_id = excluded.endpoint_id AND runs.thread_id = excluded.thread_id",
        params![
            run.run_id,
            run.endpoint_id,
            run.thread_id,
            run.state.as_str(),
            run.error_code,
            run.error_message,
            run.attempt,
            format_ts(run.created_at),
            format_ts(run.updated_at),
        ],
    )?;
    Ok(())
}

/// Delete every run of the thread whose id is not in `keep`, together
/// with its tool calls and events. Returns the number of runs removed.
pub(crate) fn retain_runs_in(conn: &Connection, key: &ThreadKey, keep: &[String]) -> StoreResult<usize> {
    let mut removed = 0;
    for run_id in list_run_ids_in(conn, key)? {
        if keep.contains(&run_id) {
            continue;
        }
        conn.execute("DELETE FROM tool_calls WHERE run_id = ?1", params![run_id])?;
        conn.execute("DELETE FROM run_events WHERE run_id = ?1", params![run_id])?;
        removed += conn.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
    }
    Ok(removed)
}

pub(crate) fn max_tool_call_id_in(conn: &Connection, key: &ThreadKey) -> StoreResult<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(tc.id), 0) FROM tool_calls tc
         JOIN runs r ON r.run_id = tc.run_id
         WHERE r.endpoint_id = ?1 AND r.thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

pub(crate) fn max_run_event_id_in(conn: &Connection, key: &ThreadKey) -> StoreResult<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM run_events WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Drop run events and tool calls above the watermarks. Tool calls are
/// scoped to the thread through their owning run.
pub(crate) fn truncate_in(
    conn: &Connection,
    key: &ThreadKey,
    run_event_watermark: i64,
    tool_call_watermark: i64,
) -> StoreResult<(usize, usize)> {
    let events = conn.execute(
        "DELETE FROM run_events WHERE endpoint_id = ?1 AND thread_id = ?2 AND id > ?3",
        params![key.endpoint_id, key.thread_id, run_event_watermark],
    )?;
    let calls = conn.execute(
        "DELETE FROM tool_calls WHERE id > ?3 AND run_id IN
            (SELECT run_id FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2)",
        params![key.endpoint_id, key.thread_id, tool_call_watermark],
    )?;
    Ok((events, calls))
}

pub(crate) fn upsert_run_in(
    conn: &Connection,
    key: &ThreadKey,
    run_id: &str,
    state: RunState,
    error: Option<(&str, &str)>,
) -> StoreResult<Run> {
    if run_id.trim().is_empty() {
        return Err(StoreError::invalid("run_id is required"));
    }
    let (error_code, error_message) = match error {
        Some((code, message)) => (Some(code), Some(message)),
        None => (None, None),
    };
    let ts = format_ts(now());

    let changed = conn.execute(
        "INSERT INTO runs (run_id, endpoint_id, thread_id, state, error_code, error_message, attempt, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
         ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            error_code = excluded.error_code,
            error_message = excluded.error_message,
            attempt = runs.attempt + CASE
                WHEN excluded.state = 'running' AND runs.state NOT IN ('accepted', 'running') THEN 1
                ELSE 0 END,
            updated_at = excluded.updated_at
         WHERE runs.endpoint_id = excluded.endpoint_id AND runs.thread_id = excluded.thread_id",
        params![
            run_id,
            key.endpoint_id,
            key.thread_id,
            state.as_str(),
            error_code,
            error_message,
            ts,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::invalid(format!(
            "run {} belongs to another thread",
            run_id
        )));
    }

    let run = get_run_in(conn, run_id)?
        .ok_or_else(|| StoreError::not_found(format!("run {}", run_id)))?;
    tracing::debug!("Run {} -> {} (attempt {})", run_id, state.as_str(), run.attempt);
    Ok(run)
}

pub struct RunRepository {
    db: Database,
}

impl RunRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the run or move it to `state`. Re-entering `running` from any
    /// state other than `accepted`/`running` counts as a new attempt.
    pub async fn upsert_run(
        &self,
        key: &ThreadKey,
        run_id: &str,
        state: RunState,
        error: Option<(&str, &str)>,
    ) -> StoreResult<Run> {
        key.validate()?;
        let conn = self.db.conn().await?;
        upsert_run_in(&conn, key, run_id, state, error)
    }

    pub async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        let conn = self.db.conn().await?;
        get_run_in(&conn, run_id)
    }

    pub async fn list_runs(&self, key: &ThreadKey) -> StoreResult<Vec<Run>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        list_runs_in(&conn, key)
    }

    /// Upsert a tool call by (run_id, tool_id). Terminal rows are never
    /// rewritten; returns false when the write was ignored for that reason.
    pub async fn upsert_tool_call(&self, update: &ToolCallUpdate) -> StoreResult<bool> {
        if update.run_id.trim().is_empty() || update.tool_id.trim().is_empty() {
            return Err(StoreError::invalid("run_id and tool_id are required"));
        }
        let args = json_to_sql(&update.args)?;
        let result = json_to_sql(&update.result)?;
        let ts = format_ts(now());

        let conn = self.db.conn().await?;
        if get_run_in(&conn, &update.run_id)?.is_none() {
            return Err(StoreError::not_found(format!("run {}", update.run_id)));
        }
        let changed = conn.execute(
            "INSERT INTO tool_calls (run_id, tool_id, tool_name, status, args, result, retryable, latency_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(run_id, tool_id) DO UPDATE SET
                tool_name = excluded.tool_name,
                status = excluded.status,
                args = COALESCE(excluded.args, tool_calls.args),
                result = excluded.result,
                retryable = excluded.retryable,
                latency_ms = excluded.latency_ms,
                updated_at = excluded.updated_at
             WHERE tool_calls.status NOT IN ('success', 'error', 'aborted', 'timeout')",
            params![
                update.run_id,
                update.tool_id,
                update.tool_name,
                update.status.as_str(),
                args,
                result,
                update.retryable,
                update.latency_ms,
                ts,
            ],
        )?;
        if changed == 0 {
            tracing::debug!(
                "Ignored update to terminal tool call {}/{}",
                update.run_id,
                update.tool_id
            );
        }
        Ok(changed > 0)
    }

    pub async fn list_tool_calls(&self, run_id: &str) -> StoreResult<Vec<ToolCallRecord>> {
        let conn = self.db.conn().await?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, tool_id, tool_name, status, args, result, retryable, latency_ms, created_at, updated_at
             FROM tool_calls WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let calls = stmt
            .query_map(params![run_id], map_tool_call)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    /// Append an event to a run's stream. The run must exist.
    pub async fn append_event(
        &self,
        run_id: &str,
        stream: &str,
        event_type: &str,
        payload: Option<serde_json::Value>,
    ) -> StoreResult<RunEvent> {
        if stream.trim().is_empty() || event_type.trim().is_empty() {
            return Err(StoreError::invalid("stream and event_type are required"));
        }
        let payload_sql = json_to_sql(&payload)?;
        let ts = now();

        let conn = self.db.conn().await?;
        let run = get_run_in(&conn, run_id)?
            .ok_or_else(|| StoreError::not_found(format!("run {}", run_id)))?;
        conn.execute(
            "INSERT INTO run_events (run_id, endpoint_id, thread_id, stream, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                run.endpoint_id,
                run.thread_id,
                stream,
                event_type,
                payload_sql,
                format_ts(ts),
            ],
        )?;

        Ok(RunEvent {
            id: conn.last_insert_rowid(),
            run_id: run_id.to_string(),
            endpoint_id: run.endpoint_id,
            thread_id: run.thread_id,
            stream: stream.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at: ts,
        })
    }

    /// Events of a run with id greater than `after_id`, oldest first
    pub async fn list_events(&self, run_id: &str, after_id: Option<i64>) -> StoreResult<Vec<RunEvent>> {
        let conn = self.db.conn().await?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, endpoint_id, thread_id, stream, event_type, payload, created_at
             FROM run_events WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![run_id, after_id.unwrap_or(0)], map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
