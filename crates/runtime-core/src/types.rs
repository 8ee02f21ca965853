//! Core type definitions for the epoch training loop

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// A worker's place in the job cohort
///
/// Assigned once when the cohort is established and immutable afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    /// Global index of this worker
    pub rank: u32,

    /// Total number of workers in the cohort
    pub size: u32,

    /// Index of this worker on its host
    pub local_rank: u32,
}

impl WorkerIdentity {
    /// Create an identity, rejecting an empty cohort or an out-of-range rank
    pub fn new(rank: u32, size: u32, local_rank: u32) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(Error::InvalidIdentity { rank, size });
        }
        Ok(Self {
            rank,
            size,
            local_rank,
        })
    }

    /// Identity of the only worker in a single-worker job
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            local_rank: 0,
        }
    }

    /// The main worker performs writes that only need to happen once
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{}", self.rank, self.size)
    }
}

/// Phases of the training loop state machine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the first epoch and between epochs
    #[default]
    Idle,

    /// Iterating the training source
    Training,

    /// Iterating the evaluation source
    Evaluating,

    /// Writing the rank-scoped checkpoint
    Checkpointing,

    /// Waiting for the cohort at the end of an epoch
    Barrier,

    /// Saving the final artifact
    Finalizing,

    /// Loop complete
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Training => "training",
            Phase::Evaluating => "evaluating",
            Phase::Checkpointing => "checkpointing",
            Phase::Barrier => "barrier",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Position of the training loop
///
/// `starting_epoch` is fixed by recovery before the loop begins; the
/// controller owns the other counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopState {
    /// First epoch this run executes
    pub starting_epoch: Epoch,

    /// Epoch currently executing
    pub current_epoch: Epoch,

    /// Batch index within the current epoch
    pub current_step: Step,

    /// Optimizer steps taken during this run
    pub optimizer_steps: Step,

    /// Phase the controller is in
    pub phase: Phase,
}

impl LoopState {
    /// Loop state resuming at the given epoch
    pub fn starting_at(epoch: Epoch) -> Self {
        Self {
            starting_epoch: epoch,
            current_epoch: epoch,
            ..Default::default()
        }
    }

    /// Number of epochs left to run before `total_epochs`
    pub fn remaining_epochs(&self, total_epochs: Epoch) -> Epoch {
        total_epochs.saturating_sub(self.starting_epoch)
    }
}
