//! Learning-rate schedules
//!
//! A schedule is a step-driven multiplier over the optimizer's base rate. It
//! is advanced once per optimizer step, after the step, so the next update
//! sees the new rate.

use bytes::Bytes;
use runtime_core::{Error, Result, ScheduleKind, SchedulePolicy, Stateful};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    kind: ScheduleKind,
    warmup_steps: u64,
    max_steps: u64,
    step: u64,
}

#[derive(Serialize, Deserialize)]
struct ScheduleState {
    kind: ScheduleKind,
    warmup_steps: u64,
    max_steps: u64,
    step: u64,
}

impl Schedule {
    pub fn new(kind: ScheduleKind, warmup_steps: u64, max_steps: u64) -> Self {
        Self {
            kind,
            warmup_steps,
            max_steps,
            step: 0,
        }
    }

    /// Resolve the job's schedule policy
    ///
    /// Returns `None` when no policy is given or it is disabled, in which case
    /// the optimizer keeps its raw configured rate. `max_train_steps`
    /// defaults to `steps_per_epoch * total_epochs`.
    pub fn build(
        policy: Option<&SchedulePolicy>,
        steps_per_epoch: u64,
        total_epochs: u64,
    ) -> Option<Self> {
        let policy = policy.filter(|p| p.enable)?;
        let max_steps = policy
            .max_train_steps
            .unwrap_or(steps_per_epoch.saturating_mul(total_epochs));

        info!(
            kind = ?policy.lr_scheduler_type,
            warmup_steps = policy.num_warmup_steps,
            max_steps,
            "Learning rate schedule enabled"
        );
        Some(Self::new(
            policy.lr_scheduler_type,
            policy.num_warmup_steps,
            max_steps,
        ))
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    /// Optimizer steps taken so far
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Move to the next optimizer step
    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Multiplier at the current step
    pub fn multiplier(&self) -> f64 {
        self.multiplier_at(self.step)
    }

    /// Effective rate for `base_learning_rate` at the current step
    pub fn learning_rate(&self, base_learning_rate: f64) -> f64 {
        base_learning_rate * self.multiplier()
    }

    pub fn multiplier_at(&self, step: u64) -> f64 {
        let warmup = self.warmup_steps;
        let in_warmup = step < warmup;
        let warmup_factor = step as f64 / warmup.max(1) as f64;

        match self.kind {
            ScheduleKind::Constant => 1.0,
            ScheduleKind::ConstantWithWarmup => {
                if in_warmup {
                    warmup_factor
                } else {
                    1.0
                }
            }
            _ if in_warmup => warmup_factor,
            ScheduleKind::Linear => {
                let remaining = self.max_steps.saturating_sub(step) as f64;
                let decay_steps = self.max_steps.saturating_sub(warmup).max(1) as f64;
                (remaining / decay_steps).max(0.0)
            }
            ScheduleKind::Cosine => {
                let progress = self.decay_progress(step);
                (0.5 * (1.0 + (PI * progress.min(1.0)).cos())).max(0.0)
            }
            ScheduleKind::CosineWithRestarts => {
                let progress = self.decay_progress(step);
                if progress >= 1.0 {
                    0.0
                } else {
                    (0.5 * (1.0 + (PI * (progress % 1.0)).cos())).max(0.0)
                }
            }
        }
    }

    fn decay_progress(&self, step: u64) -> f64 {
        let decay_steps = self.max_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        step.saturating_sub(self.warmup_steps) as f64 / decay_steps
    }
}

impl Stateful for Schedule {
    fn state_dict(&self) -> Result<Bytes> {
        let state = ScheduleState {
            kind: self.kind,
            warmup_steps: self.warmup_steps,
            max_steps: self.max_steps,
            step: self.step,
        };
        Ok(Bytes::from(serde_json::to_vec(&state)?))
    }

    fn load_state_dict(&mut self, state: &[u8]) -> Result<()> {
        let state: ScheduleState = serde_json::from_slice(state).map_err(|e| Error::StateDict {
            component: "lr_scheduler".to_string(),
            message: e.to_string(),
        })?;
        if state.kind != self.kind || state.max_steps != self.max_steps || state.warmup_steps != self.warmup_steps {
            warn!(
                saved_kind = ?state.kind,
                saved_max_steps = state.max_steps,
                saved_warmup_steps = state.warmup_steps,
                "Schedule shape changed since checkpoint, keeping step count only"
            );
        }
        self.step = state.step;
        Ok(())
    }
}
