//! Checkpoint management for the epoch training loop
//!
//! Provides the rank-scoped record format and store, and best-effort
//! recovery that degrades to a cold start.

pub mod record;
pub mod recovery;
pub mod store;

pub use record::{CheckpointRecord, RecordMetadata, CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use recovery::{ColdStartReason, RecoveryManager, RecoveryOutcome, RecoveryTargets, StateSnapshot};
pub use store::{
    CheckpointLocation, CheckpointStore, CheckpointTarget, SaveOutcome, Unconfigured,
    CHECKPOINT_FILE,
};
