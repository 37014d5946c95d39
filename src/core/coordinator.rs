//! Run lifecycle: checkpoint, execute tools, finish or roll back

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::{
    checkpoint_id_for, store, CheckpointKind, CheckpointStore, RestoreReport, ThreadCheckpoint,
};
use crate::db::repositories::{run, thread, transcript, Message, NewMessage, Run};
use crate::db::{Database, RunState, ThreadKey, ThreadRunStatus};
use crate::error::{StoreError, StoreResult};
use crate::memory::{ExtractionOutcome, MemoryExtractor};
use crate::tools::{DispatchContext, ToolCall, ToolResult, ToolScheduler};

/// What `begin_run` produced
#[derive(Debug, Clone)]
pub struct RunStart {
    pub checkpoint: ThreadCheckpoint,
    pub user_message: Message,
    pub run: Run,
}

/// How a run ended
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub state: RunState,
    /// Final assistant text, appended to the transcript
    pub final_summary: Option<String>,
    /// Finalization tag reported by the agent loop, e.g. `task_complete`
    pub finalization: Option<String>,
    pub objective: Option<String>,
    /// (code, message) for failed runs
    pub error: Option<(String, String)>,
}

impl RunCompletion {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            state: RunState::Success,
            final_summary: Some(summary.into()),
            finalization: Some("task_complete".to_string()),
            objective: None,
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state: RunState::Failed,
            final_summary: None,
            finalization: None,
            objective: None,
            error: Some((code.into(), message.into())),
        }
    }

    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = Some(objective.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub assistant_message: Option<Message>,
    pub memory: ExtractionOutcome,
}

/// Each lifecycle step commits as one transaction, so a failed step can be
/// retried without duplicating transcript rows.
pub struct RunCoordinator {
    db: Database,
    checkpoints: Arc<CheckpointStore>,
    scheduler: Arc<ToolScheduler>,
    extractor: MemoryExtractor,
}

impl RunCoordinator {
    pub fn new(db: Database, checkpoints: Arc<CheckpointStore>, scheduler: Arc<ToolScheduler>) -> Self {
        Self {
            extractor: MemoryExtractor::new(db.clone()),
            db,
            checkpoints,
            scheduler,
        }
    }

    /// Checkpoint the thread, then record the user message and start the run.
    /// Calling it again for the same run reuses the first checkpoint.
    pub async fn begin_run(&self, key: &ThreadKey, run_id: &str, user_text: &str) -> StoreResult<RunStart> {
        if user_text.trim().is_empty() {
            return Err(StoreError::invalid("user message is empty"));
        }
        let checkpoint = self.checkpoints.create(key, run_id, CheckpointKind::PreRun).await?;

        let (user_message, run) = {
            let mut conn = self.db.conn().await?;
            let tx = conn.transaction()?;
            let user_message = transcript::append_message_in(&tx, key, NewMessage::user(user_text))?;
            let run = run::upsert_run_in(&tx, key, run_id, RunState::Running, None)?;
            thread::set_run_status_in(&tx, key, ThreadRunStatus::Running)?;
            tx.commit()?;
            (user_message, run)
        };

        info!("Started run {} on {} (checkpoint {})", run_id, key, checkpoint.checkpoint_id);
        Ok(RunStart {
            checkpoint,
            user_message,
            run,
        })
    }

    /// Dispatch a batch of tool calls recorded against the run
    pub async fn dispatch_tools(
        &self,
        key: &ThreadKey,
        run_id: &str,
        mode: &str,
        cancel: CancellationToken,
        calls: Vec<ToolCall>,
    ) -> Vec<ToolResult> {
        let ctx = DispatchContext::new(mode)
            .with_cancel(cancel)
            .with_run(key.clone(), run_id);
        self.scheduler.dispatch(&ctx, calls).await
    }

    /// Record the outcome of a run and extract memory from its evidence
    pub async fn complete_run(
        &self,
        key: &ThreadKey,
        run_id: &str,
        completion: RunCompletion,
    ) -> StoreResult<RunOutcome> {
        key.validate()?;
        let checkpoint_id = checkpoint_id_for(key, run_id, CheckpointKind::PreRun);

        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;

        let current = run::get_run_in(&tx, run_id)?
            .ok_or_else(|| StoreError::not_found(format!("run {}", run_id)))?;
        if current.endpoint_id != key.endpoint_id || current.thread_id != key.thread_id {
            return Err(StoreError::invalid(format!("run {} belongs to another thread", run_id)));
        }
        if current.state.is_terminal() {
            return Err(StoreError::invalid(format!(
                "run {} already ended as {}",
                run_id,
                current.state.as_str()
            )));
        }

        // the run's user message is the first one after its pre-run watermark
        let user_message_id = match store::get_in(&tx, key, &checkpoint_id)? {
            Some(checkpoint) => transcript::list_messages_in(&tx, key, checkpoint.watermarks.transcript, 1)?
                .into_iter()
                .find(|m| m.role == "user")
                .map(|m| m.id),
            None => None,
        };

        let assistant_message = match completion.final_summary.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                Some(transcript::append_message_in(&tx, key, NewMessage::assistant(text))?)
            }
            _ => None,
        };
        transcript::append_turn_in(
            &tx,
            key,
            Some(run_id),
            user_message_id,
            assistant_message.as_ref().map(|m| m.id),
        )?;

        let error = completion
            .error
            .as_ref()
            .map(|(code, message)| (code.as_str(), message.as_str()));
        let run = run::upsert_run_in(&tx, key, run_id, completion.state, error)?;
        thread::set_run_status_in(&tx, key, ThreadRunStatus::for_run_state(completion.state))?;

        let memory = self.extractor.extract_run_in(
            &tx,
            key,
            run_id,
            completion.final_summary,
            completion.finalization,
            completion.objective,
        )?;
        tx.commit()?;

        info!("Completed run {} on {}: {}", run_id, key, run.state.as_str());
        Ok(RunOutcome {
            run,
            assistant_message,
            memory,
        })
    }

    /// Roll the thread back to the state before the run started
    pub async fn discard_run(&self, key: &ThreadKey, run_id: &str) -> StoreResult<RestoreReport> {
        let checkpoint_id = checkpoint_id_for(key, run_id, CheckpointKind::PreRun);
        let report = self.checkpoints.restore_with_report(key, &checkpoint_id).await?;
        info!("Discarded run {} on {}", run_id, key);
        Ok(report)
    }
}
