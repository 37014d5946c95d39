//! Database module

pub mod connection;
pub mod normalize;
pub mod repositories;
pub mod schema;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub use connection::Database;
pub use repositories::{
    ContextRepository, MemoryRepository, RunRepository, SpanRepository, ThreadRepository,
    ThreadStateRepository, TodosRepository, TranscriptRepository,
};
pub use normalize::{
    clamp_score, ContextLevel, MemoryKind, MemoryScope, RunState, SpanKind, ThreadRunStatus,
    ToolCallStatus,
};

/// Endpoint + thread pair that scopes every thread-owned row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub endpoint_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(endpoint_id: impl Into<String>, thread_id: impl Into<String>) -> StoreResult<Self> {
        let key = Self {
            endpoint_id: endpoint_id.into(),
            thread_id: thread_id.into(),
        };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.endpoint_id.trim().is_empty() {
            return Err(StoreError::invalid("endpoint_id is required"));
        }
        if self.thread_id.trim().is_empty() {
            return Err(StoreError::invalid("thread_id is required"));
        }
        Ok(())
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.endpoint_id, self.thread_id)
    }
}

/// Current time truncated to the stored precision (microseconds), so a
/// value read back from the database equals the value written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Stored format: RFC 3339, UTC, microseconds. Fixed width, so string
/// order is time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Text that is not RFC 3339 marks a corrupt row.
pub fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Read a timestamp column inside a row mapper
pub(crate) fn ts_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_ts_column(idx, &raw)
}

pub(crate) fn opt_ts_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| decode_ts_column(idx, &raw))
        .transpose()
}

fn decode_ts_column(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Serialize an optional JSON blob for a TEXT column
pub(crate) fn json_to_sql(value: &Option<serde_json::Value>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

/// Decode an optional TEXT column holding JSON; undecodable text is kept as a string
pub(crate) fn json_from_sql(raw: Option<String>) -> Option<serde_json::Value> {
    raw.map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)))
}
