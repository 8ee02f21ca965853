//! Per-worker training state
//!
//! Built once by [`Trainer::prepare`](crate::Trainer::prepare) and handed to
//! the loop by mutable reference. Nothing in here is shared across workers.

use checkpoint::CheckpointTarget;
use coordinator::WorkerCoordinator;
use runtime_core::{LoopState, WorkerIdentity};

use crate::schedule::Schedule;

pub struct WorkerContext<M, O, S> {
    pub(crate) coordinator: WorkerCoordinator,
    pub(crate) model: M,
    pub(crate) optimizer: O,
    pub(crate) schedule: Option<Schedule>,
    pub(crate) train: S,
    pub(crate) eval: Option<S>,
    pub(crate) checkpoint: CheckpointTarget,
    pub(crate) state: LoopState,
}

impl<M, O, S> WorkerContext<M, O, S> {
    pub fn identity(&self) -> WorkerIdentity {
        self.coordinator.identity()
    }

    pub fn coordinator(&self) -> &WorkerCoordinator {
        &self.coordinator
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Active learning-rate schedule, if one is enabled
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn checkpoint(&self) -> &CheckpointTarget {
        &self.checkpoint
    }

    pub fn has_eval(&self) -> bool {
        self.eval.is_some()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Give back the model and optimizer
    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }
}
