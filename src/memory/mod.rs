//! Memory extraction from run evidence

pub mod extract;

pub use extract::{
    blocker_id, classify_status, is_completion, plan_extraction, ExtractionOutcome, ExtractionPlan,
    MemoryExtractor, RunEvidence,
};
