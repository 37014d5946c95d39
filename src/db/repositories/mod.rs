//! Table repositories
//!
//! Each module exposes an async repository for callers plus `*_in`
//! helpers over a borrowed `Connection`, so multi-table operations can
//! compose them inside one transaction.

pub mod context;
pub mod memory;
pub mod run;
pub mod span;
pub mod thread;
pub mod thread_state;
pub mod todos;
pub mod transcript;

pub use context::{ContextRepository, ContextSnapshot};
pub use memory::{MemoryFilter, MemoryItem, MemoryRepository};
pub use run::{Run, RunEvent, RunRepository, ToolCallRecord, ToolCallUpdate};
pub use span::{ExecutionSpan, SpanRepository};
pub use thread::{Thread, ThreadRepository};
pub use thread_state::{ProviderCapabilities, ThreadState, ThreadStateRepository};
pub use todos::{TodosReplace, TodosRepository, TodosSnapshot};
pub use transcript::{ConversationTurn, Message, NewMessage, TranscriptRepository};
