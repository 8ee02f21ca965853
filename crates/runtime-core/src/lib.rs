//! Runtime Core - Foundation for the epoch training loop
//!
//! Provides the job configuration, worker identity, loop state and error
//! types shared by the storage, checkpoint, coordinator and trainer crates.

pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use config::{
    CheckpointPolicy, CoordinationConfig, DataProcesserConfig, JobConfig, ScheduleKind,
    SchedulePolicy,
};
pub use error::{Error, Result};
pub use state::Stateful;
pub use types::*;
