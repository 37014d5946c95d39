//! Checkpoint create / restore / lookup

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bundle::{DerivedStateBundle, PlaneCounts};
use crate::db::repositories::{run, thread, transcript, Thread};
use crate::db::{format_ts, now, parse_ts, Database, ThreadKey};
use crate::error::{is_constraint_violation, StoreError, StoreResult};
use crate::ids::content_id;

/// Checkpoints kept per thread when nothing else is configured
pub const DEFAULT_RETENTION: usize = 40;
pub const MAX_RETENTION: usize = 200;

/// Clamp a retention count into [1, MAX_RETENTION]
pub fn clamp_retention(n: usize) -> usize {
    n.clamp(1, MAX_RETENTION)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    #[default]
    PreRun,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::PreRun => "pre_run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_run" => Some(CheckpointKind::PreRun),
            _ => None,
        }
    }
}

/// Max id of each append-only log at capture time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Watermarks {
    pub transcript: i64,
    pub turns: i64,
    pub run_events: i64,
    pub tool_calls: i64,
}

impl Watermarks {
    fn capture_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Self> {
        Ok(Self {
            transcript: transcript::max_message_id_in(conn, key)?,
            turns: transcript::max_turn_id_in(conn, key)?,
            run_events: run::max_run_event_id_in(conn, key)?,
            tool_calls: run::max_tool_call_id_in(conn, key)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadCheckpoint {
    pub checkpoint_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    pub run_id: String,
    pub kind: CheckpointKind,
    pub format_version: u32,
    pub thread: Thread,
    pub state: DerivedStateBundle,
    pub watermarks: Watermarks,
    pub created_at: DateTime<Utc>,
}

/// Parameters for `CheckpointStore::create_with`
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub key: ThreadKey,
    pub run_id: String,
    pub kind: CheckpointKind,
    /// Explicit id; derived from (thread, run, kind) when absent
    pub checkpoint_id: Option<String>,
    /// Per-call retention override, clamped like the store default
    pub retention: Option<usize>,
}

/// Outcome of a restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub checkpoint: ThreadCheckpoint,
    pub messages_removed: usize,
    pub turns_removed: usize,
    pub run_events_removed: usize,
    pub tool_calls_removed: usize,
    pub planes: PlaneCounts,
}

/// Deterministic checkpoint id, so a retried create hits the same row
pub fn checkpoint_id_for(key: &ThreadKey, run_id: &str, kind: CheckpointKind) -> String {
    content_id(
        "ckpt",
        &[&key.endpoint_id, &key.thread_id, run_id, kind.as_str()],
    )
}

const COLUMNS: &str = "checkpoint_id, endpoint_id, thread_id, run_id, kind, format_version,
    thread_snapshot, state_bundle, transcript_watermark, turn_watermark, run_event_watermark,
    tool_call_watermark, created_at";

struct RawCheckpoint {
    checkpoint_id: String,
    endpoint_id: String,
    thread_id: String,
    run_id: String,
    kind: String,
    format_version: u32,
    thread_snapshot: String,
    state_bundle: String,
    watermarks: Watermarks,
    created_at: String,
}

fn map_raw(row: &rusqlite::Row) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        checkpoint_id: row.get(0)?,
        endpoint_id: row.get(1)?,
        thread_id: row.get(2)?,
        run_id: row.get(3)?,
        kind: row.get(4)?,
        format_version: row.get(5)?,
        thread_snapshot: row.get(6)?,
        state_bundle: row.get(7)?,
        watermarks: Watermarks {
            transcript: row.get(8)?,
            turns: row.get(9)?,
            run_events: row.get(10)?,
            tool_calls: row.get(11)?,
        },
        created_at: row.get(12)?,
    })
}

impl RawCheckpoint {
    fn decode(self) -> StoreResult<ThreadCheckpoint> {
        let kind = CheckpointKind::parse(&self.kind).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "checkpoint {} has unknown kind {}",
                self.checkpoint_id, self.kind
            ))
        })?;
        let thread: Thread = serde_json::from_str(&self.thread_snapshot).map_err(|e| {
            StoreError::Corrupt(format!(
                "checkpoint {} thread snapshot: {}",
                self.checkpoint_id, e
            ))
        })?;
        let state = DerivedStateBundle::decode(&self.state_bundle)?;

        Ok(ThreadCheckpoint {
            checkpoint_id: self.checkpoint_id,
            endpoint_id: self.endpoint_id,
            thread_id: self.thread_id,
            run_id: self.run_id,
            kind,
            format_version: self.format_version,
            thread,
            state,
            watermarks: self.watermarks,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) fn get_in(conn: &Connection, key: &ThreadKey, checkpoint_id: &str) -> StoreResult<Option<ThreadCheckpoint>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM thread_checkpoints
             WHERE endpoint_id = ?1 AND thread_id = ?2 AND checkpoint_id = ?3",
            COLUMNS
        ),
        params![key.endpoint_id, key.thread_id, checkpoint_id],
        map_raw,
    )
    .optional()?
    .map(RawCheckpoint::decode)
    .transpose()
}

pub struct CheckpointStore {
    db: Database,
    retention: usize,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Store keeping at most `retention` checkpoints per thread
    pub fn with_retention(db: Database, retention: usize) -> Self {
        Self {
            db,
            retention: clamp_retention(retention),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub async fn create(
        &self,
        key: &ThreadKey,
        run_id: &str,
        kind: CheckpointKind,
    ) -> StoreResult<ThreadCheckpoint> {
        self.create_with(CheckpointRequest {
            key: key.clone(),
            run_id: run_id.to_string(),
            kind,
            checkpoint_id: None,
            retention: None,
        })
        .await
    }

    /// Capture the thread row, every derived plane and the log watermarks
    /// in one transaction. Creating an id that already exists returns the
    /// stored checkpoint unchanged.
    pub async fn create_with(&self, req: CheckpointRequest) -> StoreResult<ThreadCheckpoint> {
        let key = &req.key;
        key.validate()?;
        if req.run_id.trim().is_empty() {
            return Err(StoreError::invalid("run_id is required"));
        }
        let checkpoint_id = match &req.checkpoint_id {
            Some(id) if id.trim().is_empty() => {
                return Err(StoreError::invalid("checkpoint_id must not be empty"));
            }
            Some(id) => id.clone(),
            None => checkpoint_id_for(key, &req.run_id, req.kind),
        };

        let checkpoint = {
            let mut conn = self.db.conn().await?;
            let tx = conn.transaction()?;

            let thread = thread::get_thread_in(&tx, key)?
                .ok_or_else(|| StoreError::not_found(format!("thread {}", key)))?;
            let state = DerivedStateBundle::capture_in(&tx, key)?;
            let watermarks = Watermarks::capture_in(&tx, key)?;

            let checkpoint = ThreadCheckpoint {
                checkpoint_id: checkpoint_id.clone(),
                endpoint_id: key.endpoint_id.clone(),
                thread_id: key.thread_id.clone(),
                run_id: req.run_id.clone(),
                kind: req.kind,
                format_version: state.format_version,
                thread,
                state,
                watermarks,
                created_at: now(),
            };

            let inserted = tx.execute(
                "INSERT INTO thread_checkpoints (checkpoint_id, endpoint_id, thread_id, run_id, kind,
                        format_version, thread_snapshot, state_bundle, transcript_watermark,
                        turn_watermark, run_event_watermark, tool_call_watermark, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    checkpoint.checkpoint_id,
                    checkpoint.endpoint_id,
                    checkpoint.thread_id,
                    checkpoint.run_id,
                    checkpoint.kind.as_str(),
                    checkpoint.format_version,
                    serde_json::to_string(&checkpoint.thread)?,
                    checkpoint.state.encode()?,
                    checkpoint.watermarks.transcript,
                    checkpoint.watermarks.turns,
                    checkpoint.watermarks.run_events,
                    checkpoint.watermarks.tool_calls,
                    format_ts(checkpoint.created_at),
                ],
            );

            match inserted {
                Ok(_) => {
                    tx.commit()?;
                    info!(
                        "Created checkpoint {} for {} (run {})",
                        checkpoint.checkpoint_id, key, checkpoint.run_id
                    );
                    checkpoint
                }
                Err(e) if is_constraint_violation(&e) => {
                    let existing = get_in(&tx, key, &checkpoint_id)?.ok_or_else(|| {
                        StoreError::invalid(format!(
                            "checkpoint id {} is used by another thread",
                            checkpoint_id
                        ))
                    })?;
                    debug!("Checkpoint {} already exists, keeping it", checkpoint_id);
                    return Ok(existing);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let keep = req.retention.map(clamp_retention).unwrap_or(self.retention);
        if let Err(e) = self.prune(key, keep).await {
            warn!("Checkpoint retention for {} failed: {}", key, e);
        }

        Ok(checkpoint)
    }

    /// Replace live thread state with the checkpoint and consume it.
    /// Everything happens in one transaction.
    pub async fn restore(&self, key: &ThreadKey, checkpoint_id: &str) -> StoreResult<ThreadCheckpoint> {
        Ok(self.restore_with_report(key, checkpoint_id).await?.checkpoint)
    }

    pub async fn restore_with_report(
        &self,
        key: &ThreadKey,
        checkpoint_id: &str,
    ) -> StoreResult<RestoreReport> {
        key.validate()?;
        if checkpoint_id.trim().is_empty() {
            return Err(StoreError::invalid("checkpoint_id is required"));
        }

        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;

        let checkpoint = get_in(&tx, key, checkpoint_id)?
            .ok_or_else(|| StoreError::not_found(format!("checkpoint {}", checkpoint_id)))?;

        if checkpoint.thread.key() != *key {
            return Err(StoreError::Corrupt(format!(
                "checkpoint {} holds a snapshot of thread {}",
                checkpoint_id,
                checkpoint.thread.key()
            )));
        }
        if thread::get_thread_in(&tx, key)?.is_none() {
            return Err(StoreError::not_found(format!("thread {}", key)));
        }

        let wm = checkpoint.watermarks;
        let (messages_removed, turns_removed) =
            transcript::truncate_in(&tx, key, wm.transcript, wm.turns)?;
        let (run_events_removed, tool_calls_removed) =
            run::truncate_in(&tx, key, wm.run_events, wm.tool_calls)?;

        let planes = checkpoint.state.restore_in(&tx, key)?;
        thread::overwrite_thread_in(&tx, &checkpoint.thread)?;

        tx.execute(
            "DELETE FROM thread_checkpoints WHERE endpoint_id = ?1 AND thread_id = ?2 AND checkpoint_id = ?3",
            params![key.endpoint_id, key.thread_id, checkpoint_id],
        )?;
        tx.commit()?;

        info!(
            "Restored {} to checkpoint {}: -{} messages, -{} turns, -{} events, -{} tool calls, -{} runs",
            key,
            checkpoint_id,
            messages_removed,
            turns_removed,
            run_events_removed,
            tool_calls_removed,
            planes.runs_removed
        );

        Ok(RestoreReport {
            checkpoint,
            messages_removed,
            turns_removed,
            run_events_removed,
            tool_calls_removed,
            planes,
        })
    }

    pub async fn get(&self, key: &ThreadKey, checkpoint_id: &str) -> StoreResult<Option<ThreadCheckpoint>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        get_in(&conn, key, checkpoint_id)
    }

    /// Most recently captured checkpoint of the thread
    pub async fn get_latest(&self, key: &ThreadKey) -> StoreResult<Option<ThreadCheckpoint>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        conn.query_row(
            &format!(
                "SELECT {} FROM thread_checkpoints WHERE endpoint_id = ?1 AND thread_id = ?2
                 ORDER BY created_at DESC, seq DESC LIMIT 1",
                COLUMNS
            ),
            params![key.endpoint_id, key.thread_id],
            map_raw,
        )
        .optional()?
        .map(RawCheckpoint::decode)
        .transpose()
    }

    /// All checkpoints of the thread, newest first
    pub async fn list(&self, key: &ThreadKey) -> StoreResult<Vec<ThreadCheckpoint>> {
        key.validate()?;
        let conn = self.db.conn().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM thread_checkpoints WHERE endpoint_id = ?1 AND thread_id = ?2
             ORDER BY created_at DESC, seq DESC",
            COLUMNS
        ))?;
        let raw = stmt
            .query_map(params![key.endpoint_id, key.thread_id], map_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawCheckpoint::decode).collect()
    }

    /// Keep the `keep` newest checkpoints of the thread; returns how many were deleted
    pub async fn prune(&self, key: &ThreadKey, keep: usize) -> StoreResult<usize> {
        key.validate()?;
        let keep = clamp_retention(keep);
        let conn = self.db.conn().await?;
        let deleted = conn.execute(
            "DELETE FROM thread_checkpoints
             WHERE endpoint_id = ?1 AND thread_id = ?2 AND seq NOT IN (
                SELECT seq FROM thread_checkpoints
                WHERE endpoint_id = ?1 AND thread_id = ?2
                ORDER BY created_at DESC, seq DESC
                LIMIT ?3)",
            params![key.endpoint_id, key.thread_id, keep as i64],
        )?;
        if deleted > 0 {
            debug!("Pruned {} checkpoints of {}", deleted, key);
        }
        Ok(deleted)
    }
}
