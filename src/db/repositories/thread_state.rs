//! Opaque per-thread state row and the provider capability cache

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{format_ts, now, parse_ts, Database, ThreadKey};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadState {
    pub endpoint_id: String,
    pub thread_id: String,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderCapabilities {
    pub provider: String,
    pub model_id: String,
    pub capabilities: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn get_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Option<ThreadState>> {
    let row = conn
        .query_row(
            "SELECT endpoint_id, thread_id, state, updated_at FROM thread_state
             WHERE endpoint_id = ?1 AND thread_id = ?2",
            params![key.endpoint_id, key.thread_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(endpoint_id, thread_id, state, updated_at)| -> StoreResult<ThreadState> {
        Ok(ThreadState {
            endpoint_id,
            thread_id,
            state: serde_json::from_str(&state)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })
    .transpose()
}

pub(crate) fn put_in(conn: &Connection, state: &ThreadState) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO thread_state (endpoint_id, thread_id, state, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(endpoint_id, thread_id) DO UPDATE SET
            state = excluded.state,
            updated_at = excluded.updated_at",
        params![
            state.endpoint_id,
            state.thread_id,
            serde_json::to_string(&state.state)?,
            format_ts(state.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_in(conn: &Connection, key: &ThreadKey) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM thread_state WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![key.endpoint_id, key.thread_id],
    )?;
    Ok(deleted)
}

pub struct ThreadStateRepository {
    db: Database,
}

impl ThreadStateRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &ThreadKey) -> StoreResult<Option<ThreadState>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        get_in(&conn, key)
    }

    pub async fn put(&self, key: &ThreadKey, state: serde_json::Value) -> StoreResult<ThreadState> {
        key.validate()?;
        let row = ThreadState {
            endpoint_id: key.endpoint_id.clone(),
            thread_id: key.thread_id.clone(),
            state,
            updated_at: now(),
        };
        let conn = self.db.conn().await?;
        put_in(&conn, &row)?;
        Ok(row)
    }

    pub async fn get_capabilities(
        &self,
        provider: &str,
        model_id: &str,
    ) -> StoreResult<Option<ProviderCapabilities>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_row(
                "SELECT capabilities, updated_at FROM provider_capabilities
                 WHERE provider = ?1 AND model_id = ?2",
                params![provider, model_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(capabilities, updated_at)| -> StoreResult<ProviderCapabilities> {
            Ok(ProviderCapabilities {
                provider: provider.to_string(),
                model_id: model_id.to_string(),
                capabilities: serde_json::from_str(&capabilities)?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    pub async fn put_capabilities(
        &self,
        provider: &str,
        model_id: &str,
        capabilities: serde_json::Value,
    ) -> StoreResult<ProviderCapabilities> {
        if provider.trim().is_empty() || model_id.trim().is_empty() {
            return Err(StoreError::invalid("provider and model_id are required"));
        }
        let ts = now();
        let conn = self.db.conn().await?;
        conn.execute(
            "INSERT INTO provider_capabilities (provider, model_id, capabilities, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider, model_id) DO UPDATE SET
                capabilities = excluded.capabilities,
                updated_at = excluded.updated_at",
            params![provider, model_id, serde_json::to_string(&capabilities)?, format_ts(ts)],
        )?;
        Ok(ProviderCapabilities {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            capabilities,
            updated_at: ts,
        })
    }
}
