//! Transcript messages and conversation turns (append-only logs)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::thread::touch_last_message_in;
use crate::db::{format_ts, json_from_sql, json_to_sql, now, ts_column, Database, ThreadKey};
use crate::error::{StoreError, StoreResult};

/// Default and maximum page size for transcript listings
pub const DEFAULT_PAGE: usize = 100;
pub const MAX_PAGE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub endpoint_id: String,
    pub thread_id: String,
    pub role: String,
    pub status: String,
    pub text: String,
    pub content: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller supplies when appending a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: String,
    pub status: String,
    pub text: String,
    pub content: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            status: "complete".to_string(),
            text: text.into(),
            content: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            ..Self::user(text)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub id: i64,
    pub endpoint_id: String,
    pub thread_id: String,
    pub run_id: Option<String>,
    pub user_message_id: Option<i64>,
    pub assistant_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str =
    "id, endpoint_id, thread_id, role, status, text, content, created_at, updated_at";

fn map_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        role: row.get(3)?,
        status: row.get(4)?,
        text: row.get(5)?,
        content: json_from_sql(row.get(6)?),
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
    })
}

fn map_turn(row: &rusqlite::Row) -> rusqlite::Result<ConversationTurn> {
    Ok(ConversationTurn {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        run_id: row.get(3)?,
        user_message_id: row.get(4)?,
        assistant_message_id: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

pub(crate) fn max_message_id_in(conn: &Connection, key: &ThreadKey) -> StoreResult<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM transcript_messages WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

pub(crate) fn max_turn_id_in(conn: &Connection, key: &ThreadKey) -> StoreResult<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM conversation_turns WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Drop every message and turn above the watermarks
pub(crate) fn truncate_in(
    conn: &Connection,
    key: &ThreadKey,
    message_watermark: i64,
    turn_watermark: i64,
) -> StoreResult<(usize, usize)> {
    let messages = conn.execute(
        "DELETE FROM transcript_messages WHERE endpoint_id = ?1 AND thread_id = ?2 AND id > ?3",
        params![key.endpoint_id, key.thread_id, message_watermark],
    )?;
    let turns = conn.execute(
        "DELETE FROM conversation_turns WHERE endpoint_id = ?1 AND thread_id = ?2 AND id > ?3",
        params![key.endpoint_id, key.thread_id, turn_watermark],
    )?;
    Ok((messages, turns))
}

pub(crate) fn list_messages_in(
    conn: &Connection,
    key: &ThreadKey,
    after_id: i64,
    limit: usize,
) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transcript_messages
         WHERE endpoint_id = ?1 AND thread_id = ?2 AND id > ?3
         ORDER BY id ASC LIMIT ?4",
        MESSAGE_COLUMNS
    ))?;
    let messages = stmt
        .query_map(
            params![key.endpoint_id, key.thread_id, after_id, limit as i64],
            map_message,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Insert a message and touch the thread row. Callers own the transaction.
pub(crate) fn append_message_in(conn: &Connection, key: &ThreadKey, message: NewMessage) -> StoreResult<Message> {
    if message.role.trim().is_empty() {
        return Err(StoreError::invalid("message role is required"));
    }
    let ts = now();
    let content = json_to_sql(&message.content)?;
    conn.execute(
        "INSERT INTO transcript_messages (endpoint_id, thread_id, role, status, text, content, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            key.endpoint_id,
            key.thread_id,
            message.role,
            message.status,
            message.text,
            content,
            format_ts(ts),
        ],
    )?;
    let id = conn.last_insert_rowid();
    touch_last_message_in(conn, key, &message.text, ts)?;

    Ok(Message {
        id,
        endpoint_id: key.endpoint_id.clone(),
        thread_id: key.thread_id.clone(),
        role: message.role,
        status: message.status,
        text: message.text,
        content: message.content,
        created_at: ts,
        updated_at: ts,
    })
}

pub(crate) fn append_turn_in(
    conn: &Connection,
    key: &ThreadKey,
    run_id: Option<&str>,
    user_message_id: Option<i64>,
    assistant_message_id: Option<i64>,
) -> StoreResult<ConversationTurn> {
    let ts = now();
    conn.execute(
        "INSERT INTO conversation_turns (endpoint_id, thread_id, run_id, user_message_id, assistant_message_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.endpoint_id,
            key.thread_id,
            run_id,
            user_message_id,
            assistant_message_id,
            format_ts(ts),
        ],
    )?;

    Ok(ConversationTurn {
        id: conn.last_insert_rowid(),
        endpoint_id: key.endpoint_id.clone(),
        thread_id: key.thread_id.clone(),
        run_id: run_id.map(String::from),
        user_message_id,
        assistant_message_id,
        created_at: ts,
    })
}

pub struct TranscriptRepository {
    db: Database,
}

impl TranscriptRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message and refresh the thread's last-message preview in
    /// one transaction
    pub async fn append_message(&self, key: &ThreadKey, message: NewMessage) -> StoreResult<Message> {
        key.validate()?;
        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;
        let message = append_message_in(&tx, key, message)?;
        tx.commit()?;

        tracing::debug!("Appended message {} to {}", message.id, key);
        Ok(message)
    }

    /// Messages with id greater than `after_id`, oldest first
    pub async fn list_messages(
        &self,
        key: &ThreadKey,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Message>> {
        key.validate()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let conn = self.db.conn().await?;
        list_messages_in(&conn, key, after_id.unwrap_or(0), limit)
    }

    /// Edit a message in place by row id
    pub async fn update_message_content(
        &self,
        key: &ThreadKey,
        id: i64,
        status: &str,
        text: &str,
        content: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        key.validate()?;
        let content = json_to_sql(&content)?;
        let conn = self.db.conn().await?;
        let updated = conn.execute(
            "UPDATE transcript_messages SET status = ?1, text = ?2, content = ?3, updated_at = ?4
             WHERE id = ?5 AND endpoint_id = ?6 AND thread_id = ?7",
            params![status, text, content, format_ts(now()), id, key.endpoint_id, key.thread_id],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found(format!("message {} in {}", id, key)));
        }
        Ok(())
    }

    pub async fn max_message_id(&self, key: &ThreadKey) -> StoreResult<i64> {
        key.validate()?;
        let conn = self.db.conn().await?;
        max_message_id_in(&conn, key)
    }

    pub async fn append_turn(
        &self,
        key: &ThreadKey,
        run_id: Option<&str>,
        user_message_id: Option<i64>,
        assistant_message_id: Option<i64>,
    ) -> StoreResult<ConversationTurn> {
        key.validate()?;
        let conn = self.db.conn().await?;
        append_turn_in(&conn, key, run_id, user_message_id, assistant_message_id)
    }

    pub async fn list_turns(&self, key: &ThreadKey) -> StoreResult<Vec<ConversationTurn>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        let mut stmt = conn.prepare(
            "SELECT id, endpoint_id, thread_id, run_id, user_message_id, assistant_message_id, created_at
             FROM conversation_turns WHERE endpoint_id = ?1 AND thread_id = ?2 ORDER BY id ASC",
        )?;
        let turns = stmt
            .query_map(params![key.endpoint_id, key.thread_id], map_turn)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }
}
