//! Thread repository

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{format_ts, now, opt_ts_column, ts_column, Database, ThreadKey, ThreadRunStatus};
use crate::error::{is_constraint_violation, StoreError, StoreResult};

/// Characters of the latest message kept on the thread row
pub const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub endpoint_id: String,
    pub thread_id: String,
    pub title: Option<String>,
    pub model_id: Option<String>,
    pub run_status: ThreadRunStatus,
    pub waiting_prompt_id: Option<String>,
    pub waiting_prompt_kind: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn key(&self) -> ThreadKey {
        ThreadKey {
            endpoint_id: self.endpoint_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

const COLUMNS: &str = "endpoint_id, thread_id, title, model_id, run_status, waiting_prompt_id,
    waiting_prompt_kind, last_message_preview, last_message_at, created_at, updated_at";

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Thread> {
    Ok(Thread {
        endpoint_id: row.get(0)?,
        thread_id: row.get(1)?,
        title: row.get(2)?,
        model_id: row.get(3)?,
        run_status: ThreadRunStatus::normalize(&row.get::<_, String>(4)?),
        waiting_prompt_id: row.get(5)?,
        waiting_prompt_kind: row.get(6)?,
        last_message_preview: row.get(7)?,
        last_message_at: opt_ts_column(row, 8)?,
        created_at: ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}

pub(crate) fn get_thread_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Option<Thread>> {
    let thread = conn
        .query_row(
            &format!("SELECT {} FROM threads WHERE endpoint_id = ?1 AND thread_id = ?2", COLUMNS),
            params![key.endpoint_id, key.thread_id],
            map_row,
        )
        .optional()?;
    Ok(thread)
}

/// Overwrite every mutable column of the live row from `snapshot`
pub(crate) fn overwrite_thread_in(conn: &Connection, snapshot: &Thread) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE threads SET title = ?1, model_id = ?2, run_status = ?3, waiting_prompt_id = ?4,
                waiting_prompt_kind = ?5, last_message_preview = ?6, last_message_at = ?7,
                created_at = ?8, updated_at = ?9
         WHERE endpoint_id = ?10 AND thread_id = ?11",
        params![
            snapshot.title,
            snapshot.model_id,
            snapshot.run_status.as_str(),
            snapshot.waiting_prompt_id,
            snapshot.waiting_prompt_kind,
            snapshot.last_message_preview,
            snapshot.last_message_at.map(format_ts),
            format_ts(snapshot.created_at),
            format_ts(snapshot.updated_at),
            snapshot.endpoint_id,
            snapshot.thread_id,
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found(format!(
            "thread {}/{}",
            snapshot.endpoint_id, snapshot.thread_id
        )));
    }
    Ok(())
}

pub(crate) fn touch_last_message_in(
    conn: &Connection,
    key: &ThreadKey,
    text: &str,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    let preview: String = text.chars().take(PREVIEW_CHARS).collect();
    let updated = conn.execute(
        "UPDATE threads SET last_message_preview = ?1, last_message_at = ?2, updated_at = ?2
         WHERE endpoint_id = ?3 AND thread_id = ?4",
        params![preview, format_ts(at), key.endpoint_id, key.thread_id],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found(format!("thread {}", key)));
    }
    Ok(())
}

pub(crate) fn set_run_status_in(
    conn: &Connection,
    key: &ThreadKey,
    status: ThreadRunStatus,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE threads SET run_status = ?1, updated_at = ?2 WHERE endpoint_id = ?3 AND thread_id = ?4",
        params![status.as_str(), format_ts(now()), key.endpoint_id, key.thread_id],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found(format!("thread {}", key)));
    }
    Ok(())
}

pub struct ThreadRepository {
    db: Database,
}

impl ThreadRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create a new thread. Fails with `InvalidRequest` if it already exists.
    pub async fn create(
        &self,
        key: &ThreadKey,
        title: Option<String>,
        model_id: Option<String>,
    ) -> StoreResult<Thread> {
        key.validate()?;
        let ts = now();

        let thread = Thread {
            endpoint_id: key.endpoint_id.clone(),
            thread_id: key.thread_id.clone(),
            title,
            model_id,
            run_status: ThreadRunStatus::Idle,
            waiting_prompt_id: None,
            waiting_prompt_kind: None,
            last_message_preview: None,
            last_message_at: None,
            created_at: ts,
            updated_at: ts,
        };

        let conn = self.db.conn().await?;
        let inserted = conn.execute(
            "INSERT INTO threads (endpoint_id, thread_id, title, model_id, run_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                thread.endpoint_id,
                thread.thread_id,
                thread.title,
                thread.model_id,
                thread.run_status.as_str(),
                format_ts(thread.created_at),
                format_ts(thread.updated_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::invalid(format!("thread {} already exists", key)));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Created thread: {}", key);
        Ok(thread)
    }

    pub async fn get(&self, key: &ThreadKey) -> StoreResult<Option<Thread>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        get_thread_in(&conn, key)
    }

    /// Threads on an endpoint, most recently updated first
    pub async fn list(&self, endpoint_id: &str) -> StoreResult<Vec<Thread>> {
        let conn = self.db.conn().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM threads WHERE endpoint_id = ?1 ORDER BY updated_at DESC, thread_id",
            COLUMNS
        ))?;
        let threads = stmt
            .query_map(params![endpoint_id], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(threads)
    }

    pub async fn set_run_status(&self, key: &ThreadKey, status: ThreadRunStatus) -> StoreResult<()> {
        key.validate()?;
        let conn = self.db.conn().await?;
        set_run_status_in(&conn, key, status)?;
        tracing::debug!("Thread {} run status -> {}", key, status.as_str());
        Ok(())
    }

    /// Point the thread at a prompt it is waiting on, or clear it with `None`
    pub async fn set_waiting_prompt(
        &self,
        key: &ThreadKey,
        prompt: Option<(&str, &str)>,
    ) -> StoreResult<()> {
        key.validate()?;
        let (prompt_id, prompt_kind) = match prompt {
            Some((id, kind)) => (Some(id), Some(kind)),
            None => (None, None),
        };
        let conn = self.db.conn().await?;
        let updated = conn.execute(
            "UPDATE threads SET waiting_prompt_id = ?1, waiting_prompt_kind = ?2, updated_at = ?3
             WHERE endpoint_id = ?4 AND thread_id = ?5",
            params![prompt_id, prompt_kind, format_ts(now()), key.endpoint_id, key.thread_id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found(format!("thread {}", key)));
        }
        Ok(())
    }

    pub async fn set_model(&self, key: &ThreadKey, model_id: &str) -> StoreResult<()> {
        key.validate()?;
        let conn = self.db.conn().await?;
        let updated = conn.execute(
            "UPDATE threads SET model_id = ?1, updated_at = ?2 WHERE endpoint_id = ?3 AND thread_id = ?4",
            params![model_id, format_ts(now()), key.endpoint_id, key.thread_id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found(format!("thread {}", key)));
        }
        Ok(())
    }

    /// Delete a thread and everything it owns
    pub async fn delete(&self, key: &ThreadKey) -> StoreResult<()> {
        key.validate()?;
        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM tool_calls WHERE run_id IN
                (SELECT run_id FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2)",
            params![key.endpoint_id, key.thread_id],
        )?;
        for table in [
            "run_events",
            "runs",
            "transcript_messages",
            "conversation_turns",
            "thread_state",
            "thread_todos",
            "context_snapshots",
            "execution_spans",
            "memory_items",
            "thread_checkpoints",
            "threads",
        ] {
            tx.execute(
                &format!("DELETE FROM {} WHERE endpoint_id = ?1 AND thread_id = ?2", table),
                params![key.endpoint_id, key.thread_id],
            )?;
        }

        tx.commit()?;
        tracing::debug!("Deleted thread: {}", key);
        Ok(())
    }
}
