//! Application wiring and the run lifecycle

pub mod coordinator;
pub mod state;

pub use coordinator::{RunCompletion, RunCoordinator, RunOutcome, RunStart};
pub use state::AppState;
