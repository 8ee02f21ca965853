//! Loop events
//!
//! The controller reports every phase boundary to a [`LoopObserver`]. Events
//! are emitted on the worker's own task, in order.

use runtime_core::{Epoch, Phase, Step, WorkerIdentity};
use serde::{Deserialize, Serialize};

use crate::metrics::EvalMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    PhaseStarted {
        epoch: Epoch,
        phase: Phase,
    },
    PhaseFinished {
        epoch: Epoch,
        phase: Phase,
    },
    /// Emitted on every `log_step` boundary
    TrainStep {
        epoch: Epoch,
        step: Step,
        loss: f64,
        learning_rate: f64,
    },
    EvalCompleted {
        epoch: Epoch,
        metrics: EvalMetrics,
    },
    CheckpointSaved {
        epoch: Epoch,
        path: String,
        size_bytes: u64,
    },
    CheckpointFailed {
        epoch: Epoch,
        error: String,
    },
    ArtifactSaved {
        path: String,
        size_bytes: u64,
    },
    Done {
        epochs_run: u64,
    },
}

pub trait LoopObserver: Send + Sync {
    fn on_event(&self, worker: WorkerIdentity, event: &LoopEvent);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl LoopObserver for NoopObserver {
    fn on_event(&self, _worker: WorkerIdentity, _event: &LoopEvent) {}
}
