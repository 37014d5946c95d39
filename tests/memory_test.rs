// Tests for the run lifecycle and memory extraction

use std::sync::Arc;

use async_trait::async_trait;
use runledger::checkpoint::{checkpoint_id_for, CheckpointKind};
use runledger::config::Config;
use runledger::core::{AppState, RunCompletion};
use runledger::db::repositories::{MemoryFilter, NewMessage};
use runledger::db::{Database, MemoryKind, MemoryScope, RunState, ThreadKey, ThreadRunStatus};
use runledger::memory::{blocker_id, MemoryExtractor, RunEvidence};
use runledger::tools::{
    DispatchContext, HandlerError, ToolCall, ToolDef, ToolHandler, ToolOutput, ToolSource,
    ToolStatus, MODE_ACT,
};
use runledger::StoreError;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Fails unless called with `{"ok": true}`
struct ApplyPatch;

#[async_trait]
impl ToolHandler for ApplyPatch {
    async fn execute(&self, _ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        if call.args.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(ToolOutput::new("patch applied"))
        } else {
            Err(HandlerError::failed("hunk 2 does not apply"))
        }
    }
}

fn setup() -> (AppState, ThreadKey, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("test.db")).unwrap();
    let state = AppState::new(db, Config::default()).unwrap();
    state
        .registry
        .register(
            ToolDef::new("apply_patch", "apply a patch", json!({"type": "object"}))
                .mutating(true)
                .source(ToolSource::Skill),
            Arc::new(ApplyPatch),
        )
        .unwrap();
    (state, ThreadKey::new("local", "t1").unwrap(), temp_dir)
}

async fn blockers(state: &AppState, key: &ThreadKey) -> Vec<String> {
    let filter = MemoryFilter {
        scope: None,
        kind: Some(MemoryKind::Blocker),
    };
    state
        .memory
        .list(key, &filter)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect()
}

async fn patch(state: &AppState, key: &ThreadKey, run_id: &str, tool_id: &str, ok: bool) -> ToolStatus {
    let results = state
        .coordinator
        .dispatch_tools(
            key,
            run_id,
            MODE_ACT,
            CancellationToken::new(),
            vec![ToolCall::new(tool_id, "apply_patch", json!({"ok": ok}))],
        )
        .await;
    results[0].status
}

#[tokio::test]
async fn test_failed_tool_becomes_blocker() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();

    state.coordinator.begin_run(&key, "r1", "fix the build").await.unwrap();
    assert_eq!(patch(&state, &key, "r1", "c1", false).await, ToolStatus::Error);

    let outcome = state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::failed("tool_failed", "patch did not apply"))
        .await
        .unwrap();
    assert_eq!(outcome.run.state, RunState::Failed);
    assert!(outcome.assistant_message.is_none());

    let found = blockers(&state, &key).await;
    assert_eq!(found.len(), 1);
    assert!(found[0].starts_with("Tool blocked: apply_patch"));
    assert!(found[0].contains("hunk 2 does not apply"));

    let item = state
        .memory
        .list(&key, &MemoryFilter::default())
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.memory_id == blocker_id(&key, "apply_patch"))
        .unwrap();
    assert_eq!(item.scope, MemoryScope::Working);
    assert_eq!(item.source_run_id.as_deref(), Some("r1"));

    let thread = state.threads.get(&key).await.unwrap().unwrap();
    assert_eq!(thread.run_status, ThreadRunStatus::for_run_state(RunState::Failed));
}

#[tokio::test]
async fn test_later_success_clears_blocker() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();

    state.coordinator.begin_run(&key, "r1", "fix the build").await.unwrap();
    patch(&state, &key, "r1", "c1", false).await;
    assert_eq!(patch(&state, &key, "r1", "c2", true).await, ToolStatus::Success);

    let outcome = state
        .coordinator
        .complete_run(
            &key,
            "r1",
            RunCompletion::success("Build fixed").with_objective("keep CI green"),
        )
        .await
        .unwrap();
    assert!(outcome.assistant_message.is_some());
    assert!(blockers(&state, &key).await.is_empty());

    let items = state.memory.list(&key, &MemoryFilter::default()).await.unwrap();
    assert!(items
        .iter()
        .any(|m| m.kind == MemoryKind::Decision && m.content == "Build fixed"));
    assert!(items
        .iter()
        .any(|m| m.kind == MemoryKind::Constraint && m.content == "Objective: keep CI green"));
}

#[tokio::test]
async fn test_success_in_new_run_clears_old_blocker() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();

    state.coordinator.begin_run(&key, "r1", "try").await.unwrap();
    patch(&state, &key, "r1", "c1", false).await;
    state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::failed("tool_failed", "no"))
        .await
        .unwrap();
    assert_eq!(blockers(&state, &key).await.len(), 1);

    state.coordinator.begin_run(&key, "r2", "try again").await.unwrap();
    patch(&state, &key, "r2", "c1", true).await;
    state
        .coordinator
        .complete_run(&key, "r2", RunCompletion::success("done"))
        .await
        .unwrap();
    assert!(blockers(&state, &key).await.is_empty());
}

#[tokio::test]
async fn test_tool_calls_are_recorded() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    state.coordinator.begin_run(&key, "r1", "go").await.unwrap();

    patch(&state, &key, "r1", "c1", true).await;

    let calls = state.runs.list_tool_calls("r1").await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_name, "apply_patch");
    assert!(calls[0].latency_ms.is_some());

    let events = state.runs.list_events("r1", None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "tool_call");
    assert_eq!(events[0].payload.as_ref().unwrap()["status"], json!("success"));
}

#[tokio::test]
async fn test_begin_run_checkpoints_before_user_message() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    state.transcript.append_message(&key, NewMessage::user("earlier")).await.unwrap();

    let start = state.coordinator.begin_run(&key, "r1", "now").await.unwrap();
    assert_eq!(start.checkpoint.checkpoint_id, checkpoint_id_for(&key, "r1", CheckpointKind::PreRun));
    assert!(start.user_message.id > start.checkpoint.watermarks.transcript);
    assert_eq!(start.run.state, RunState::Running);

    let err = state.coordinator.begin_run(&key, "r2", "   ").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_complete_run_twice_is_rejected() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    state.coordinator.begin_run(&key, "r1", "go").await.unwrap();

    state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("ok"))
        .await
        .unwrap();
    let err = state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("ok"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));

    let turns = state.transcript.list_turns(&key).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert!(turns[0].user_message_id.is_some());
    assert!(turns[0].assistant_message_id.is_some());
}

#[tokio::test]
async fn test_discard_run_rolls_back() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    let before = state.threads.get(&key).await.unwrap().unwrap();

    state.coordinator.begin_run(&key, "r1", "go").await.unwrap();
    patch(&state, &key, "r1", "c1", false).await;

    let report = state.coordinator.discard_run(&key, "r1").await.unwrap();
    assert_eq!(report.messages_removed, 1);
    assert_eq!(report.planes.runs_removed, 1);

    assert_eq!(state.threads.get(&key).await.unwrap().unwrap(), before);
    assert!(state.runs.get_run("r1").await.unwrap().is_none());
    assert!(state.transcript.list_messages(&key, None, None).await.unwrap().is_empty());

    let err = state.coordinator.discard_run(&key, "r1").await.unwrap_err();
    assert!(err.is_not_found());
}

async fn fail_writes_to(state: &AppState, table: &str, op: &str) {
    let sql = format!(
        "CREATE TRIGGER fail_{table} BEFORE {op} ON {table} BEGIN SELECT RAISE(ABORT, 'disk hiccup'); END;"
    );
    state.db.conn().await.unwrap().execute_batch(&sql).unwrap();
}

async fn restore_writes_to(state: &AppState, table: &str) {
    let sql = format!("DROP TRIGGER fail_{table};");
    state.db.conn().await.unwrap().execute_batch(&sql).unwrap();
}

#[tokio::test]
async fn test_failed_completion_leaves_nothing_behind() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    state.coordinator.begin_run(&key, "r1", "go").await.unwrap();

    // the run update comes after the assistant message and the turn
    fail_writes_to(&state, "runs", "UPDATE").await;
    let err = state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("done"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)));

    let messages = state.transcript.list_messages(&key, None, None).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert!(state.transcript.list_turns(&key).await.unwrap().is_empty());
    assert_eq!(state.runs.get_run("r1").await.unwrap().unwrap().state, RunState::Running);
    let thread = state.threads.get(&key).await.unwrap().unwrap();
    assert_eq!(thread.run_status, ThreadRunStatus::Running);

    restore_writes_to(&state, "runs").await;
    state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("done"))
        .await
        .unwrap();

    let messages = state.transcript.list_messages(&key, None, None).await.unwrap();
    assert_eq!(messages.iter().filter(|m| m.role == "assistant").count(), 1);
    assert_eq!(state.transcript.list_turns(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_memory_failure_fails_the_completion() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    state.coordinator.begin_run(&key, "r1", "go").await.unwrap();

    fail_writes_to(&state, "memory_items", "INSERT").await;
    let err = state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("Build fixed"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Sqlite(_)));
    assert_eq!(state.runs.get_run("r1").await.unwrap().unwrap().state, RunState::Running);
    assert!(state.transcript.list_turns(&key).await.unwrap().is_empty());

    restore_writes_to(&state, "memory_items").await;
    let outcome = state
        .coordinator
        .complete_run(&key, "r1", RunCompletion::success("Build fixed"))
        .await
        .unwrap();
    assert!(outcome.memory.upserted > 0);
}

#[tokio::test]
async fn test_failed_start_can_be_retried() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();

    fail_writes_to(&state, "runs", "INSERT").await;
    assert!(state.coordinator.begin_run(&key, "r1", "go").await.is_err());
    assert!(state.transcript.list_messages(&key, None, None).await.unwrap().is_empty());

    restore_writes_to(&state, "runs").await;
    let start = state.coordinator.begin_run(&key, "r1", "go").await.unwrap();
    assert_eq!(state.transcript.list_messages(&key, None, None).await.unwrap().len(), 1);
    assert_eq!(state.checkpoints.list(&key).await.unwrap().len(), 1);
    assert_eq!(start.checkpoint.watermarks.transcript, 0);
}

#[tokio::test]
async fn test_extractor_is_idempotent() {
    let (state, key, _temp) = setup();
    state.threads.create(&key, None, None).await.unwrap();
    let extractor = MemoryExtractor::new(state.db.clone());
    let evidence = RunEvidence {
        key: key.clone(),
        run_id: "r1".into(),
        spans: Vec::new(),
        final_summary: Some("Shipped it".into()),
        finalization: Some("task_complete".into()),
        objective: None,
    };

    extractor.apply(&evidence).await.unwrap();
    extractor.apply(&evidence).await.unwrap();
    let items = state.memory.list(&key, &MemoryFilter::default()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].kind, MemoryKind::Decision);
}
