//! SQL schema definitions and forward-only migrations

use rusqlite::{params, Connection};
use tracing::{info, warn};

/// Schema version stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 3;

pub const SCHEMA: &str = r#"
-- Threads table
CREATE TABLE IF NOT EXISTS threads (
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    title TEXT,
    model_id TEXT,
    run_status TEXT NOT NULL DEFAULT 'idle',
    waiting_prompt_id TEXT,
    waiting_prompt_kind TEXT,
    last_message_preview TEXT,
    last_message_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id)
);

-- Transcript (append-only)
CREATE TABLE IF NOT EXISTS transcript_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'complete',
    text TEXT NOT NULL DEFAULT '',
    content TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Conversation turns (append-only)
CREATE TABLE IF NOT EXISTS conversation_turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    run_id TEXT,
    user_message_id INTEGER,
    assistant_message_id INTEGER,
    created_at TEXT NOT NULL
);

-- Runs
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    state TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    attempt INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Tool calls, keyed by (run_id, tool_id)
CREATE TABLE IF NOT EXISTS tool_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    tool_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    status TEXT NOT NULL,
    args TEXT,
    result TEXT,
    retryable INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (run_id, tool_id)
);

-- Run events (append-only)
CREATE TABLE IF NOT EXISTS run_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    stream TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL
);

-- Thread state (one row per thread)
CREATE TABLE IF NOT EXISTS thread_state (
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id)
);

-- Versioned todos (one row per thread)
CREATE TABLE IF NOT EXISTS thread_todos (
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    todos TEXT NOT NULL,
    updated_by TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id)
);

-- Context snapshots (append-only)
CREATE TABLE IF NOT EXISTS context_snapshots (
    snapshot_id TEXT PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    level TEXT NOT NULL,
    summary TEXT NOT NULL,
    quality_score REAL NOT NULL DEFAULT 0,
    turn_start INTEGER,
    turn_end INTEGER,
    created_at TEXT NOT NULL
);

-- Execution spans
CREATE TABLE IF NOT EXISTS execution_spans (
    span_id TEXT PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    run_id TEXT,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    updated_at TEXT NOT NULL
);

-- Memory items
CREATE TABLE IF NOT EXISTS memory_items (
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    importance REAL NOT NULL,
    freshness REAL NOT NULL,
    confidence REAL NOT NULL,
    source_run_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id, memory_id)
);

-- Provider capability cache
CREATE TABLE IF NOT EXISTS provider_capabilities (
    provider TEXT NOT NULL,
    model_id TEXT NOT NULL,
    capabilities TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (provider, model_id)
);

-- Thread checkpoints
CREATE TABLE IF NOT EXISTS thread_checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    checkpoint_id TEXT NOT NULL UNIQUE,
    endpoint_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    format_version INTEGER NOT NULL DEFAULT 1,
    thread_snapshot TEXT NOT NULL,
    state_bundle TEXT NOT NULL,
    transcript_watermark INTEGER NOT NULL,
    turn_watermark INTEGER NOT NULL,
    run_event_watermark INTEGER NOT NULL,
    tool_call_watermark INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_threads_endpoint ON threads(endpoint_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_transcript_thread ON transcript_messages(endpoint_id, thread_id, id);
CREATE INDEX IF NOT EXISTS idx_turns_thread ON conversation_turns(endpoint_id, thread_id, id);
CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(endpoint_id, thread_id);
CREATE INDEX IF NOT EXISTS idx_tool_calls_run ON tool_calls(run_id, id);
CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, id);
CREATE INDEX IF NOT EXISTS idx_run_events_thread ON run_events(endpoint_id, thread_id, id);
CREATE INDEX IF NOT EXISTS idx_context_thread ON context_snapshots(endpoint_id, thread_id, created_at);
CREATE INDEX IF NOT EXISTS idx_spans_thread ON execution_spans(endpoint_id, thread_id, started_at);
CREATE INDEX IF NOT EXISTS idx_memory_thread ON memory_items(endpoint_id, thread_id, kind);
CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON thread_checkpoints(endpoint_id, thread_id, created_at);
"#;

pub fn user_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, column, definition))?;
    info!("Migrated {}: added column {}", table, column);
    Ok(())
}

/// Create missing tables and apply every migration step newer than the
/// stored `user_version`. Each step is safe to re-run.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let current = user_version(conn)?;
    if current > SCHEMA_VERSION {
        warn!(
            "Database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        );
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(SCHEMA)?;

    if current < 2 {
        add_column_if_missing(&tx, "tool_calls", "retryable", "INTEGER NOT NULL DEFAULT 0")?;
    }
    if current < 3 {
        add_column_if_missing(
            &tx,
            "thread_checkpoints",
            "format_version",
            "INTEGER NOT NULL DEFAULT 1",
        )?;
    }
    if current < SCHEMA_VERSION {
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    tx.commit()
}
