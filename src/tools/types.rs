//! Tool definitions, calls and results

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::db::{ThreadKey, ToolCallStatus};

/// Read-only mode: mutating tools are hidden
pub const MODE_PLAN: &str = "plan";
/// Unrestricted mode
pub const MODE_ACT: &str = "act";

/// Where a tool definition came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Builtin,
    Mcp,
    Skill,
    Subagent,
}

impl ToolSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolSource::Builtin => "builtin",
            ToolSource::Mcp => "mcp",
            ToolSource::Skill => "skill",
            ToolSource::Subagent => "subagent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "builtin" => Some(ToolSource::Builtin),
            "mcp" => Some(ToolSource::Mcp),
            "skill" => Some(ToolSource::Skill),
            "subagent" => Some(ToolSource::Subagent),
            _ => None,
        }
    }
}

/// Trust order used to break priority ties. Earlier entries win; a
/// source missing from the list ranks below every listed one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SourceRanking(pub Vec<ToolSource>);

impl Default for SourceRanking {
    fn default() -> Self {
        Self(vec![
            ToolSource::Builtin,
            ToolSource::Mcp,
            ToolSource::Skill,
            ToolSource::Subagent,
        ])
    }
}

impl SourceRanking {
    /// Lower is more trusted
    pub fn rank(&self, source: ToolSource) -> usize {
        self.0
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.0.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default)]
    pub mutating: bool,
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(default)]
    pub priority: i32,
    pub source: ToolSource,
}

impl ToolDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            mutating: false,
            parallel_safe: false,
            priority: 0,
            source: ToolSource::Builtin,
        }
    }

    pub fn mutating(mut self, mutating: bool) -> Self {
        self.mutating = mutating;
        self
    }

    pub fn parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    /// Eligible for the concurrent group of a dispatch
    pub fn runs_in_parallel(&self) -> bool {
        self.parallel_safe && !self.mutating
    }
}

/// One call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }
}

/// Incremental argument text for a call still being streamed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialToolCall {
    pub tool_id: String,
    pub tool_name: String,
    pub args_delta: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Aborted,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Aborted => "aborted",
            ToolStatus::Timeout => "timeout",
        }
    }
}

impl From<ToolStatus> for ToolCallStatus {
    fn from(status: ToolStatus) -> Self {
        match status {
            ToolStatus::Success => ToolCallStatus::Success,
            ToolStatus::Error => ToolCallStatus::Error,
            ToolStatus::Aborted => ToolCallStatus::Aborted,
            ToolStatus::Timeout => ToolCallStatus::Timeout,
        }
    }
}

/// Stable error code plus a human-readable message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolErrorInfo {
    pub code: String,
    pub message: String,
}

impl ToolErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub const CODE_ARGUMENT_ERROR: &str = "argument_error";
pub const CODE_ABORTED: &str = "aborted";
pub const CODE_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, summary: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            tool_id: call.tool_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Success,
            summary: summary.into(),
            details,
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, status: ToolStatus, error: ToolErrorInfo) -> Self {
        Self {
            tool_id: call.tool_id.clone(),
            tool_name: call.tool_name.clone(),
            status,
            summary: error.message.clone(),
            details: None,
            error: Some(error),
        }
    }

    pub fn error(call: &ToolCall, error: ToolErrorInfo) -> Self {
        Self::failure(call, ToolStatus::Error, error)
    }

    pub fn argument_error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self::error(call, ToolErrorInfo::new(CODE_ARGUMENT_ERROR, message))
    }

    pub fn aborted(call: &ToolCall, message: impl Into<String>) -> Self {
        Self::failure(call, ToolStatus::Aborted, ToolErrorInfo::new(CODE_ABORTED, message))
    }

    pub fn timeout(call: &ToolCall, message: impl Into<String>) -> Self {
        Self::failure(call, ToolStatus::Timeout, ToolErrorInfo::new(CODE_TIMEOUT, message))
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

/// What a handler returns on success. A `None` status becomes `success`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub status: Option<ToolStatus>,
    pub summary: String,
    pub details: Option<Value>,
}

impl ToolOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            status: None,
            summary: summary.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Thread and run a dispatch belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    pub key: ThreadKey,
    pub run_id: String,
}

/// Per-dispatch context shared by handlers and interceptors
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub mode: String,
    pub cancel: CancellationToken,
    pub run: Option<RunScope>,
}

impl DispatchContext {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            cancel: CancellationToken::new(),
            run: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run(mut self, key: ThreadKey, run_id: impl Into<String>) -> Self {
        self.run = Some(RunScope {
            key,
            run_id: run_id.into(),
        });
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ranking_prefers_builtin() {
        let ranking = SourceRanking::default();
        assert!(ranking.rank(ToolSource::Builtin) < ranking.rank(ToolSource::Mcp));
        assert!(ranking.rank(ToolSource::Skill) < ranking.rank(ToolSource::Subagent));

        let partial = SourceRanking(vec![ToolSource::Skill]);
        assert_eq!(partial.rank(ToolSource::Skill), 0);
        assert_eq!(partial.rank(ToolSource::Builtin), 1);
    }

    #[test]
    fn only_safe_readers_run_in_parallel() {
        let def = ToolDef::new("grep", "", Value::Null).parallel_safe(true);
        assert!(def.runs_in_parallel());
        assert!(!def.clone().mutating(true).runs_in_parallel());
        assert!(!def.parallel_safe(false).runs_in_parallel());
    }
}
