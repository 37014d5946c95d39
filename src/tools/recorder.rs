//! Persists tool calls of run-scoped dispatches

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use super::handler::ToolInterceptor;
use super::types::{DispatchContext, RunScope, ToolCall, ToolErrorInfo, ToolResult, ToolStatus};
use crate::db::repositories::{ExecutionSpan, ToolCallUpdate};
use crate::db::{now, Database, RunRepository, SpanKind, SpanRepository, ToolCallStatus};
use crate::ids::content_id;

/// Stream name of tool events in the run log
pub const TOOL_STREAM: &str = "tool";
pub const TOOL_CALL_EVENT: &str = "tool_call";

/// Writes a tool-call record, a run event and an execution span for every
/// call of a dispatch that carries a run scope. Storage failures are
/// logged and never alter the tool result.
pub struct RecordingInterceptor {
    runs: RunRepository,
    spans: SpanRepository,
    started: Mutex<HashMap<String, (Instant, DateTime<Utc>)>>,
}

impl RecordingInterceptor {
    pub fn new(db: Database) -> Self {
        Self {
            runs: RunRepository::new(db.clone()),
            spans: SpanRepository::new(db),
            started: Mutex::new(HashMap::new()),
        }
    }

    fn slot(scope: &RunScope, tool_id: &str) -> String {
        format!("{}/{}", scope.run_id, tool_id)
    }

    /// Span id of a tool call, stable across retries of the same call
    pub fn span_id(run_id: &str, tool_id: &str) -> String {
        content_id("span", &[run_id, tool_id])
    }
}

#[async_trait]
impl ToolInterceptor for RecordingInterceptor {
    async fn before_exec(&self, ctx: &DispatchContext, call: &mut ToolCall) -> Result<(), ToolErrorInfo> {
        let Some(scope) = &ctx.run else {
            return Ok(());
        };

        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::slot(scope, &call.tool_id), (Instant::now(), now()));

        let update = ToolCallUpdate {
            run_id: scope.run_id.clone(),
            tool_id: call.tool_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolCallStatus::Running,
            args: Some(call.args.clone()),
            result: None,
            retryable: false,
            latency_ms: None,
        };
        if let Err(e) = self.runs.upsert_tool_call(&update).await {
            warn!("Failed to record start of tool call {}: {}", call.tool_id, e);
        }
        Ok(())
    }

    async fn finished(&self, ctx: &DispatchContext, call: &ToolCall, result: &ToolResult) {
        let Some(scope) = &ctx.run else {
            return;
        };

        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::slot(scope, &call.tool_id));
        let (latency_ms, started_at) = match started {
            Some((instant, at)) => (Some(instant.elapsed().as_millis() as i64), at),
            None => (None, now()),
        };

        let result_json = match serde_json::to_value(result) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Failed to encode result of tool call {}: {}", call.tool_id, e);
                None
            }
        };

        let update = ToolCallUpdate {
            run_id: scope.run_id.clone(),
            tool_id: call.tool_id.clone(),
            tool_name: call.tool_name.clone(),
            status: result.status.into(),
            args: Some(call.args.clone()),
            result: result_json,
            retryable: matches!(result.status, ToolStatus::Timeout | ToolStatus::Aborted),
            latency_ms,
        };
        if let Err(e) = self.runs.upsert_tool_call(&update).await {
            warn!("Failed to record tool call {}: {}", call.tool_id, e);
        }

        let payload = json!({
            "tool_id": call.tool_id,
            "tool_name": call.tool_name,
            "status": result.status.as_str(),
            "summary": result.summary,
            "error": result.error,
            "latency_ms": latency_ms,
        });

        if let Err(e) = self
            .runs
            .append_event(&scope.run_id, TOOL_STREAM, TOOL_CALL_EVENT, Some(payload.clone()))
            .await
        {
            warn!("Failed to append tool event for {}: {}", call.tool_id, e);
        }

        let ended_at = now();
        let span = ExecutionSpan {
            span_id: Self::span_id(&scope.run_id, &call.tool_id),
            endpoint_id: scope.key.endpoint_id.clone(),
            thread_id: scope.key.thread_id.clone(),
            run_id: Some(scope.run_id.clone()),
            kind: SpanKind::Tool,
            name: call.tool_name.clone(),
            status: result.status.as_str().to_string(),
            payload: Some(payload),
            started_at,
            ended_at: Some(ended_at),
            updated_at: ended_at,
        };
        if let Err(e) = self.spans.upsert(&span).await {
            warn!("Failed to record span for tool call {}: {}", call.tool_id, e);
        }
    }
}
