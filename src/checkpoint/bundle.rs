//! Derived-state bundle stored inside a checkpoint
//!
//! The bundle is JSON with an explicit `format_version`. Planes added in
//! later versions must be `#[serde(default)]` so older bundles still decode.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::repositories::{
    context, memory, run, span, thread_state, todos, ContextSnapshot, ExecutionSpan, MemoryFilter,
    MemoryItem, Run, ThreadState, TodosSnapshot,
};
use crate::db::ThreadKey;
use crate::error::{StoreError, StoreResult};

/// Newest bundle format this build reads and writes
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedStateBundle {
    pub format_version: u32,
    #[serde(default)]
    pub memory_items: Vec<MemoryItem>,
    #[serde(default)]
    pub todos: Option<TodosSnapshot>,
    #[serde(default)]
    pub thread_state: Option<ThreadState>,
    #[serde(default)]
    pub context_snapshots: Vec<ContextSnapshot>,
    #[serde(default)]
    pub execution_spans: Vec<ExecutionSpan>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

/// Rows written back per plane by a restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneCounts {
    pub memory_items: usize,
    pub context_snapshots: usize,
    pub execution_spans: usize,
    pub runs_removed: usize,
}

impl DerivedStateBundle {
    /// Read every derived plane of the thread
    pub(crate) fn capture_in(conn: &Connection, key: &ThreadKey) -> StoreResult<Self> {
        Ok(Self {
            format_version: BUNDLE_FORMAT_VERSION,
            memory_items: memory::list_in(conn, key, &MemoryFilter::default())?,
            todos: todos::get_in(conn, key)?,
            thread_state: thread_state::get_in(conn, key)?,
            context_snapshots: context::list_in(conn, key)?,
            execution_spans: span::list_in(conn, key, None)?,
            runs: run::list_runs_in(conn, key)?,
        })
    }

    pub fn encode(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> StoreResult<Self> {
        let bundle: Self = serde_json::from_str(raw)
            .map_err(|e| StoreError::Corrupt(format!("undecodable state bundle: {}", e)))?;
        if bundle.format_version == 0 || bundle.format_version > BUNDLE_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported state bundle version {}",
                bundle.format_version
            )));
        }
        Ok(bundle)
    }

    /// Every captured row must belong to `key`
    pub(crate) fn verify_scope(&self, key: &ThreadKey) -> StoreResult<()> {
        let owners = self
            .memory_items
            .iter()
            .map(|m| (&m.endpoint_id, &m.thread_id))
            .chain(self.todos.iter().map(|t| (&t.endpoint_id, &t.thread_id)))
            .chain(self.thread_state.iter().map(|s| (&s.endpoint_id, &s.thread_id)))
            .chain(self.context_snapshots.iter().map(|c| (&c.endpoint_id, &c.thread_id)))
            .chain(self.execution_spans.iter().map(|s| (&s.endpoint_id, &s.thread_id)))
            .chain(self.runs.iter().map(|r| (&r.endpoint_id, &r.thread_id)));

        for (endpoint_id, thread_id) in owners {
            if endpoint_id != &key.endpoint_id || thread_id != &key.thread_id {
                return Err(StoreError::Corrupt(format!(
                    "state bundle row for {}/{} inside checkpoint of {}",
                    endpoint_id, thread_id, key
                )));
            }
        }
        Ok(())
    }

    /// Replace every derived plane of the thread with the captured rows,
    /// drop runs that did not exist at capture time and reset the others
    pub(crate) fn restore_in(&self, conn: &Connection, key: &ThreadKey) -> StoreResult<PlaneCounts> {
        self.verify_scope(key)?;

        memory::delete_all_in(conn, key)?;
        for item in &self.memory_items {
            memory::upsert_in(conn, item)?;
        }

        todos::delete_in(conn, key)?;
        if let Some(snapshot) = &self.todos {
            todos::insert_exact_in(conn, snapshot)?;
        }

        thread_state::delete_in(conn, key)?;
        if let Some(state) = &self.thread_state {
            thread_state::put_in(conn, state)?;
        }

        context::delete_all_in(conn, key)?;
        for snapshot in &self.context_snapshots {
            context::insert_in(conn, snapshot)?;
        }

        span::delete_all_in(conn, key)?;
        for span in &self.execution_spans {
            span::upsert_in(conn, span)?;
        }

        let keep: Vec<String> = self.runs.iter().map(|r| r.run_id.clone()).collect();
        let runs_removed = run::retain_runs_in(conn, key, &keep)?;
        for captured in &self.runs {
            run::put_run_exact_in(conn, captured)?;
        }

        Ok(PlaneCounts {
            memory_items: self.memory_items.len(),
            context_snapshots: self.context_snapshots.len(),
            execution_spans: self.execution_spans.len(),
            runs_removed,
        })
    }
}
