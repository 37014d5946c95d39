//! Enum normalization helpers
//!
//! Every enum column is stored as its `as_str` form. `parse` is strict;
//! `normalize` is what readers use: it lowercases, folds aliases and
//! clamps anything unknown to a default so old or hand-edited rows still load.

use serde::{Deserialize, Serialize};

fn canonical(s: &str) -> String {
    s.trim().to_lowercase().replace(['-', ' '], "_")
}

/// Clamp a score into [0, 1]. NaN becomes 0.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRunStatus {
    Idle,
    Running,
    WaitingApproval,
    WaitingUser,
    Recovering,
}

impl ThreadRunStatus {
    pub const ALL: [ThreadRunStatus; 5] = [
        ThreadRunStatus::Idle,
        ThreadRunStatus::Running,
        ThreadRunStatus::WaitingApproval,
        ThreadRunStatus::WaitingUser,
        ThreadRunStatus::Recovering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadRunStatus::Idle => "idle",
            ThreadRunStatus::Running => "running",
            ThreadRunStatus::WaitingApproval => "waiting_approval",
            ThreadRunStatus::WaitingUser => "waiting_user",
            ThreadRunStatus::Recovering => "recovering",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        Self::parse(&canonical(s)).unwrap_or(ThreadRunStatus::Idle)
    }

    /// Thread status that mirrors a run entering `state`
    pub fn for_run_state(state: RunState) -> Self {
        match state {
            RunState::Accepted | RunState::Running => ThreadRunStatus::Running,
            RunState::WaitingApproval => ThreadRunStatus::WaitingApproval,
            RunState::WaitingUser => ThreadRunStatus::WaitingUser,
            RunState::Recovering => ThreadRunStatus::Recovering,
            _ => ThreadRunStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Accepted,
    Running,
    WaitingApproval,
    Recovering,
    WaitingUser,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

impl RunState {
    pub const ALL: [RunState; 9] = [
        RunState::Accepted,
        RunState::Running,
        RunState::WaitingApproval,
        RunState::Recovering,
        RunState::WaitingUser,
        RunState::Success,
        RunState::Failed,
        RunState::Canceled,
        RunState::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Accepted => "accepted",
            RunState::Running => "running",
            RunState::WaitingApproval => "waiting_approval",
            RunState::Recovering => "recovering",
            RunState::WaitingUser => "waiting_user",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
            RunState::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        match canonical(s).as_str() {
            "cancelled" => RunState::Canceled,
            "timeout" => RunState::TimedOut,
            "succeeded" | "completed" => RunState::Success,
            "error" => RunState::Failed,
            other => Self::parse(other).unwrap_or(RunState::Accepted),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Success | RunState::Failed | RunState::Canceled | RunState::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
    Aborted,
    Timeout,
}

impl ToolCallStatus {
    pub const ALL: [ToolCallStatus; 6] = [
        ToolCallStatus::Pending,
        ToolCallStatus::Running,
        ToolCallStatus::Success,
        ToolCallStatus::Error,
        ToolCallStatus::Aborted,
        ToolCallStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
            ToolCallStatus::Aborted => "aborted",
            ToolCallStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        match canonical(s).as_str() {
            "failed" => ToolCallStatus::Error,
            "canceled" | "cancelled" => ToolCallStatus::Aborted,
            "timed_out" => ToolCallStatus::Timeout,
            "ok" | "succeeded" => ToolCallStatus::Success,
            other => Self::parse(other).unwrap_or(ToolCallStatus::Pending),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolCallStatus::Pending | ToolCallStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Working,
    Episodic,
    LongTerm,
}

impl MemoryScope {
    pub const ALL: [MemoryScope; 3] = [MemoryScope::Working, MemoryScope::Episodic, MemoryScope::LongTerm];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Working => "working",
            MemoryScope::Episodic => "episodic",
            MemoryScope::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        match canonical(s).as_str() {
            "longterm" | "long" => MemoryScope::LongTerm,
            "episode" => MemoryScope::Episodic,
            other => Self::parse(other).unwrap_or(MemoryScope::Working),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Decision,
    Constraint,
    Blocker,
    Artifact,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 5] = [
        MemoryKind::Fact,
        MemoryKind::Decision,
        MemoryKind::Constraint,
        MemoryKind::Blocker,
        MemoryKind::Artifact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Decision => "decision",
            MemoryKind::Constraint => "constraint",
            MemoryKind::Blocker => "blocker",
            MemoryKind::Artifact => "artifact",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        match canonical(s).as_str() {
            "facts" => MemoryKind::Fact,
            "blocked" => MemoryKind::Blocker,
            other => Self::parse(other).unwrap_or(MemoryKind::Artifact),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Turn,
    Episode,
    Thread,
}

impl ContextLevel {
    pub const ALL: [ContextLevel; 3] = [ContextLevel::Turn, ContextLevel::Episode, ContextLevel::Thread];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::Turn => "turn",
            ContextLevel::Episode => "episode",
            ContextLevel::Thread => "thread",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        Self::parse(&canonical(s)).unwrap_or(ContextLevel::Turn)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Tool,
    Reasoning,
    System,
}

impl SpanKind {
    pub const ALL: [SpanKind; 3] = [SpanKind::Tool, SpanKind::Reasoning, SpanKind::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Tool => "tool",
            SpanKind::Reasoning => "reasoning",
            SpanKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    pub fn normalize(s: &str) -> Self {
        Self::parse(&canonical(s)).unwrap_or(SpanKind::System)
    }
}
