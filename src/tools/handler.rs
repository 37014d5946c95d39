//! Handler and interceptor seams

use async_trait::async_trait;

use super::types::{DispatchContext, PartialToolCall, ToolCall, ToolErrorInfo, ToolOutput, ToolResult};

/// Failure reported by a tool handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler observed the dispatch cancellation signal
    #[error("canceled")]
    Canceled,

    /// The handler's own deadline expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        HandlerError::Failed(anyhow::anyhow!("{}", msg))
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError>;

    /// Streaming argument fragments. Called without validation.
    async fn handle_partial(
        &self,
        _ctx: &DispatchContext,
        _partial: &PartialToolCall,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Hooks wrapped around every executed call, in registration order.
#[async_trait]
pub trait ToolInterceptor: Send + Sync {
    /// May rewrite the call. An error short-circuits to an `error` result.
    async fn before_exec(&self, _ctx: &DispatchContext, _call: &mut ToolCall) -> Result<(), ToolErrorInfo> {
        Ok(())
    }

    /// Runs on successful results only. An error replaces the result.
    async fn after_exec(
        &self,
        _ctx: &DispatchContext,
        _call: &ToolCall,
        _result: &mut ToolResult,
    ) -> Result<(), ToolErrorInfo> {
        Ok(())
    }

    /// Observes the final result of every call that reached execution
    async fn finished(&self, _ctx: &DispatchContext, _call: &ToolCall, _result: &ToolResult) {}
}
