//! Batch dispatch of tool calls
//!
//! Calls that resolve and validate are split in two groups. Parallel-safe
//! readers run first, bounded by a semaphore. Everything else then runs one
//! at a time in submission order. Every input call yields exactly one
//! result, at its input index.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::classify::{DefaultClassifier, ErrorClassifier, CODE_EXECUTION};
use super::handler::{HandlerError, ToolInterceptor};
use super::policy::{DefaultModePolicy, ModePolicy};
use super::registry::{RegisteredTool, ToolRegistry};
use super::types::{
    DispatchContext, PartialToolCall, ToolCall, ToolDef, ToolErrorInfo, ToolResult, ToolStatus,
    CODE_ABORTED, CODE_ARGUMENT_ERROR, CODE_TIMEOUT,
};
use super::validate::validate_args;

/// Concurrent handler invocations per dispatch
pub const DEFAULT_MAX_PARALLEL: usize = 2;

pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    policy: Arc<dyn ModePolicy>,
    classifier: Arc<dyn ErrorClassifier>,
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
    max_parallel: usize,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            policy: Arc::new(DefaultModePolicy),
            classifier: Arc::new(DefaultClassifier),
            interceptors: Vec::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ModePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Interceptors run in the order they are added
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ToolInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Tools usable under `mode`, priority descending then name
    pub fn active_tools(&self, mode: &str) -> Vec<ToolDef> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|def| self.policy.allows(mode, def))
            .collect()
    }

    fn resolve_active(&self, mode: &str, name: &str) -> Option<RegisteredTool> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.registry
            .resolve(name)
            .filter(|tool| self.policy.allows(mode, &tool.def))
    }

    fn prepare(&self, mode: &str, call: &ToolCall) -> Result<RegisteredTool, ToolResult> {
        if call.tool_name.trim().is_empty() {
            return Err(ToolResult::argument_error(call, "tool name is required"));
        }
        let tool = self.resolve_active(mode, &call.tool_name).ok_or_else(|| {
            ToolResult::argument_error(call, format!("unknown or disabled tool: {}", call.tool_name))
        })?;
        validate_args(&tool.def.input_schema, &call.args)
            .map_err(|msg| ToolResult::argument_error(call, msg))?;
        Ok(tool)
    }

    pub async fn dispatch(&self, ctx: &DispatchContext, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut parallel = Vec::new();
        let mut serial = Vec::new();

        for (index, call) in calls.iter().enumerate() {
            match self.prepare(&ctx.mode, call) {
                Ok(tool) if tool.def.runs_in_parallel() => parallel.push((index, tool)),
                Ok(tool) => serial.push((index, tool)),
                Err(result) => {
                    debug!("Rejected tool call {}: {}", call.tool_id, result.summary);
                    slots[index] = Some(result);
                }
            }
        }

        debug!(
            "Dispatching {} calls in {} mode: {} parallel, {} serial",
            calls.len(),
            ctx.mode,
            parallel.len(),
            serial.len()
        );

        let semaphore = Semaphore::new(self.max_parallel);
        let workers = parallel.into_iter().map(|(index, tool)| {
            let call = calls[index].clone();
            let semaphore = &semaphore;
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => None,
                    permit = semaphore.acquire() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => self.execute(ctx, &tool, call).await,
                    None => ToolResult::aborted(&call, "canceled before start"),
                };
                (index, result)
            }
        });
        for (index, result) in join_all(workers).await {
            slots[index] = Some(result);
        }

        for (index, tool) in serial {
            let call = calls[index].clone();
            let result = if ctx.is_cancelled() {
                ToolResult::aborted(&call, "canceled before start")
            } else {
                self.execute(ctx, &tool, call).await
            };
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .zip(calls.iter())
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| {
                    warn!("Tool call {} was never dispatched", call.tool_id);
                    ToolResult::aborted(call, "tool not dispatched")
                })
            })
            .collect()
    }

    async fn execute(&self, ctx: &DispatchContext, tool: &RegisteredTool, mut call: ToolCall) -> ToolResult {
        for interceptor in &self.interceptors {
            if let Err(err) = interceptor.before_exec(ctx, &mut call).await {
                let result = ToolResult::error(&call, err);
                self.finish(ctx, &call, &result).await;
                return result;
            }
        }

        // a panicking handler fails its own call, not the batch
        let outcome = AssertUnwindSafe(tool.handler.execute(ctx, &call))
            .catch_unwind()
            .await;

        let mut result = match outcome {
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("Tool {} ({}) panicked: {}", call.tool_name, call.tool_id, msg);
                ToolResult::error(&call, ToolErrorInfo::new(CODE_EXECUTION, format!("tool panicked: {}", msg)))
            }
            Ok(Ok(output)) => ToolResult {
                tool_id: call.tool_id.clone(),
                tool_name: call.tool_name.clone(),
                status: output.status.unwrap_or(ToolStatus::Success),
                summary: output.summary,
                details: output.details,
                error: None,
            },
            Ok(Err(HandlerError::Canceled)) => ToolResult::aborted(&call, "canceled"),
            Ok(Err(HandlerError::DeadlineExceeded)) => ToolResult::timeout(&call, "deadline exceeded"),
            Ok(Err(HandlerError::Failed(err))) => ToolResult::error(&call, self.classifier.classify(&err)),
        };

        if result.is_success() {
            for interceptor in &self.interceptors {
                if let Err(err) = interceptor.after_exec(ctx, &call, &mut result).await {
                    result = ToolResult::error(&call, err);
                    break;
                }
            }
        }

        debug!(
            "Tool {} ({}) finished: {}",
            call.tool_name,
            call.tool_id,
            result.status.as_str()
        );
        self.finish(ctx, &call, &result).await;
        result
    }

    async fn finish(&self, ctx: &DispatchContext, call: &ToolCall, result: &ToolResult) {
        for interceptor in &self.interceptors {
            interceptor.finished(ctx, call, result).await;
        }
    }

    /// Route a streamed argument fragment to its handler. Arguments are
    /// not validated here; only `dispatch` validates.
    pub async fn handle_partial(
        &self,
        ctx: &DispatchContext,
        partial: &PartialToolCall,
    ) -> Result<(), ToolErrorInfo> {
        let tool = self.resolve_active(&ctx.mode, &partial.tool_name).ok_or_else(|| {
            ToolErrorInfo::new(
                CODE_ARGUMENT_ERROR,
                format!("unknown or disabled tool: {}", partial.tool_name),
            )
        })?;
        match tool.handler.handle_partial(ctx, partial).await {
            Ok(()) => Ok(()),
            Err(HandlerError::Canceled) => Err(ToolErrorInfo::new(CODE_ABORTED, "canceled")),
            Err(HandlerError::DeadlineExceeded) => {
                Err(ToolErrorInfo::new(CODE_TIMEOUT, "deadline exceeded"))
            }
            Err(HandlerError::Failed(err)) => Err(self.classifier.classify(&err)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
