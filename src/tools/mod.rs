//! Tool registry and batch scheduler

pub mod builtin;
pub mod classify;
pub mod handler;
pub mod policy;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod validate;

pub use builtin::{builtin_tools, register_builtin_tools};
pub use classify::{DefaultClassifier, ErrorClassifier};
pub use handler::{HandlerError, ToolHandler, ToolInterceptor};
pub use policy::{DefaultModePolicy, ModePolicy};
pub use recorder::RecordingInterceptor;
pub use registry::{RegisterOutcome, RegisteredTool, RegistryError, ToolRegistry};
pub use scheduler::{ToolScheduler, DEFAULT_MAX_PARALLEL};
pub use types::{
    DispatchContext, PartialToolCall, RunScope, SourceRanking, ToolCall, ToolDef, ToolErrorInfo,
    ToolOutput, ToolResult, ToolSource, ToolStatus, MODE_ACT, MODE_PLAN,
};
pub use validate::validate_args;
