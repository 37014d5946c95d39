//! Pre-run checkpoints and restore
//!
//! A checkpoint pins a thread at the moment a run is about to start: the
//! thread row, a bundle of every derived plane, and watermarks over the
//! append-only logs. Restoring rolls the thread back to that point and
//! consumes the checkpoint.

pub mod bundle;
pub mod store;

pub use bundle::{DerivedStateBundle, PlaneCounts, BUNDLE_FORMAT_VERSION};
pub use store::{
    checkpoint_id_for, clamp_retention, CheckpointKind, CheckpointRequest, CheckpointStore,
    RestoreReport, ThreadCheckpoint, Watermarks, DEFAULT_RETENTION, MAX_RETENTION,
};
