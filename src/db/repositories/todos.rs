//! Versioned todos snapshot, one row per thread
//!
//! Writers replace the whole list under optimistic concurrency: the caller
//! passes the version it last read, and the write only lands if that is
//! still the stored version.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{format_ts, now, ts_column, Database, ThreadKey};
use crate::error::{is_constraint_violation, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodosSnapshot {
    pub endpoint_id: String,
    pub thread_id: String,
    pub version: i64,
    pub todos: serde_json::Value,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A replacement todo list
#[derive(Debug, Clone)]
pub struct TodosReplace {
    pub key: ThreadKey,
    pub todos: serde_json::Value,
    pub updated_by: Option<String>,
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<TodosSnapshot> {
    let raw: String = row.get(3)?;
    Ok(TodosSnapshot {
        endpoint_id: row.get(0)?,
        thread_id: row.get(1)?,
        version: row.get(2)?,
        todos: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Array(Vec::new())),
        updated_by: row.get(4)?,
        updated_at: ts_column(row, 5)?,
    })
}

pub(crate) fn get_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Option<TodosSnapshot>> {
    let snapshot = conn
        .query_row(
            "SELECT endpoint_id, thread_id, version, todos, updated_by, updated_at
             FROM thread_todos WHERE endpoint_id = ?1 AND thread_id = ?2",
            params![key.endpoint_id, key.thread_id],
            map_row,
        )
        .optional()?;
    Ok(snapshot)
}

pub(crate) fn delete_in(conn: &Connection, key: &ThreadKey) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM thread_todos WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
    )?;
    Ok(deleted)
}

/// Write a captured row back verbatim, version included
pub(crate) fn insert_exact_in(conn: &Connection, snapshot: &TodosSnapshot) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO thread_todos (endpoint_id, thread_id, version, todos, updated_by, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            snapshot.endpoint_id,
            snapshot.thread_id,
            snapshot.version,
            serde_json::to_string(&snapshot.todos)?,
            snapshot.updated_by,
            format_ts(snapshot.updated_at),
        ],
    )?;
    Ok(())
}

pub struct TodosRepository {
    db: Database,
}

impl TodosRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &ThreadKey) -> StoreResult<Option<TodosSnapshot>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        get_in(&conn, key)
    }

    /// Compare-and-swap the todo list.
    ///
    /// With no row yet, `expected_version` must be `None` or `Some(0)` and
    /// the row is created at version 1. Otherwise a supplied version must
    /// equal the stored one, and the row moves to `current + 1`.
    pub async fn replace_snapshot(
        &self,
        rec: &TodosReplace,
        expected_version: Option<i64>,
    ) -> StoreResult<TodosSnapshot> {
        rec.key.validate()?;
        if !rec.todos.is_array() {
            return Err(StoreError::invalid("todos must be a JSON array"));
        }
        let todos = serde_json::to_string(&rec.todos)?;
        let ts = now();
        let key = &rec.key;

        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM thread_todos WHERE endpoint_id = ?1 AND thread_id = ?2",
                params![key.endpoint_id, key.thread_id],
                |row| row.get(0),
            )
            .optional()?;

        let version = match current {
            None => {
                if expected_version.is_some_and(|v| v != 0) {
                    return Err(StoreError::VersionConflict {
                        expected: expected_version,
                        current: 0,
                    });
                }
                let inserted = tx.execute(
                    "INSERT INTO thread_todos (endpoint_id, thread_id, version, todos, updated_by, updated_at)
                     VALUES (?1, ?2, 1, ?3, ?4, ?5)",
                    params![key.endpoint_id, key.thread_id, todos, rec.updated_by, format_ts(ts)],
                );
                match inserted {
                    Ok(_) => 1,
                    Err(e) if is_constraint_violation(&e) => {
                        return Err(StoreError::VersionConflict {
                            expected: expected_version,
                            current: 0,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(current) => {
                if expected_version.is_some_and(|v| v != current) {
                    return Err(StoreError::VersionConflict {
                        expected: expected_version,
                        current,
                    });
                }
                let updated = tx.execute(
                    "UPDATE thread_todos SET version = ?1, todos = ?2, updated_by = ?3, updated_at = ?4
                     WHERE endpoint_id = ?5 AND thread_id = ?6 AND version = ?7",
                    params![
                        current + 1,
                        todos,
                        rec.updated_by,
                        format_ts(ts),
                        key.endpoint_id,
                        key.thread_id,
                        current,
                    ],
                )?;
                if updated == 0 {
                    debug!("Todos write for {} lost a race at version {}", key, current);
                    return Err(StoreError::VersionConflict {
                        expected: expected_version,
                        current,
                    });
                }
                current + 1
            }
        };

        tx.commit()?;
        info!("Replaced todos for {} (version {})", key, version);

        Ok(TodosSnapshot {
            endpoint_id: key.endpoint_id.clone(),
            thread_id: key.thread_id.clone(),
            version,
            todos: rec.todos.clone(),
            updated_by: rec.updated_by.clone(),
            updated_at: ts,
        })
    }
}
