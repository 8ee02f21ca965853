//! Best-effort recovery from this rank's last checkpoint
//!
//! Recovery never fails the job. Every problem ends in
//! [`RecoveryOutcome::ColdStart`] with the reason attached, and the caller
//! decides how loudly to log it. Ranks recover independently, so the caller
//! must [`reconcile`](RecoveryOutcome::reconcile) the cohort's results before
//! the loop starts.

use bytes::Bytes;
use runtime_core::{Epoch, Error, LoopState, Stateful};
use std::fmt;
use tracing::{error, info, warn};

use crate::record::CheckpointRecord;
use crate::store::{CheckpointTarget, Unconfigured};

/// State that recovery rehydrates in place
pub struct RecoveryTargets<'a> {
    pub model: &'a mut (dyn Stateful + Send),
    pub optimizer: &'a mut (dyn Stateful + Send),
    pub scheduler: Option<&'a mut (dyn Stateful + Send)>,
}

/// Why the job starts from epoch zero
#[derive(Debug)]
pub enum ColdStartReason {
    /// Checkpointing is not configured
    NotConfigured(Unconfigured),

    /// No record exists yet at the rank's path
    NotFound { path: String },

    /// The record exists but could not be read or decoded
    Unreadable(Error),

    /// The storage holding the record failed
    StorageUnavailable(Error),

    /// A collaborator rejected the saved state
    Rehydrate(Error),

    /// Ranks recovered different starting epochs, ordered by rank
    CohortDisagreement { starting_epochs: Vec<Epoch> },
}

impl fmt::Display for ColdStartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColdStartReason::NotConfigured(reason) => write!(f, "{}", reason),
            ColdStartReason::NotFound { path } => write!(f, "no checkpoint at {}", path),
            ColdStartReason::Unreadable(e) => write!(f, "checkpoint unreadable: {}", e),
            ColdStartReason::StorageUnavailable(e) => write!(f, "checkpoint storage unavailable: {}", e),
            ColdStartReason::Rehydrate(e) => write!(f, "rehydration failed: {}", e),
            ColdStartReason::CohortDisagreement { starting_epochs } => {
                write!(f, "workers recovered different starting epochs {:?}", starting_epochs)
            }
        }
    }
}

/// Result of a recovery attempt
#[derive(Debug)]
pub enum RecoveryOutcome {
    Recovered {
        /// Epoch stored in the record
        checkpoint_epoch: Epoch,
        /// Path the record was read from
        path: String,
    },
    ColdStart(ColdStartReason),
}

impl RecoveryOutcome {
    /// First epoch the loop should run
    pub fn starting_epoch(&self) -> Epoch {
        match self {
            RecoveryOutcome::Recovered {
                checkpoint_epoch, ..
            } => checkpoint_epoch + 1,
            RecoveryOutcome::ColdStart(_) => 0,
        }
    }

    /// Initial loop state for the controller
    pub fn loop_state(&self) -> LoopState {
        LoopState::starting_at(self.starting_epoch())
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryOutcome::Recovered { .. })
    }

    /// Settle on one starting epoch for the whole cohort
    ///
    /// `starting_epochs` holds every rank's own result. A rank only holds its
    /// latest record, so unless every rank agrees the whole cohort cold-starts.
    pub fn reconcile(self, starting_epochs: &[Epoch]) -> Self {
        let own = self.starting_epoch();
        if starting_epochs.iter().all(|epoch| *epoch == own) {
            return self;
        }
        RecoveryOutcome::ColdStart(ColdStartReason::CohortDisagreement {
            starting_epochs: starting_epochs.to_vec(),
        })
    }

    /// Log the outcome at the level it deserves
    pub fn log(&self) {
        match self {
            RecoveryOutcome::Recovered {
                checkpoint_epoch,
                path,
            } => info!(
                checkpoint_epoch = checkpoint_epoch,
                starting_epoch = self.starting_epoch(),
                path = %path,
                "Recovered from checkpoint"
            ),
            RecoveryOutcome::ColdStart(ColdStartReason::NotConfigured(Unconfigured::NoPolicy)) => {
                info!("Checkpoint not configured, cold start")
            }
            RecoveryOutcome::ColdStart(reason @ ColdStartReason::StorageUnavailable(_)) => {
                error!(reason = %reason, "Recovery skipped, cold start")
            }
            RecoveryOutcome::ColdStart(reason) => {
                warn!(reason = %reason, "Recovery skipped, cold start")
            }
        }
    }
}

/// State of every recovery target, captured so a recovery can be undone
pub struct StateSnapshot {
    model: Bytes,
    optimizer: Bytes,
    scheduler: Option<Bytes>,
}

impl StateSnapshot {
    pub fn capture(targets: &RecoveryTargets<'_>) -> runtime_core::Result<Self> {
        Ok(Self {
            model: targets.model.state_dict()?,
            optimizer: targets.optimizer.state_dict()?,
            scheduler: targets.scheduler.as_ref().map(|s| s.state_dict()).transpose()?,
        })
    }

    /// Load the captured state back into the targets
    pub fn restore(&self, targets: RecoveryTargets<'_>) -> runtime_core::Result<()> {
        let RecoveryTargets {
            model,
            optimizer,
            scheduler,
        } = targets;
        model.load_state_dict(&self.model)?;
        optimizer.load_state_dict(&self.optimizer)?;
        if let (Some(scheduler), Some(state)) = (scheduler, &self.scheduler) {
            scheduler.load_state_dict(state)?;
        }
        Ok(())
    }
}

/// Loads the rank's checkpoint and rehydrates model, optimizer and schedule
pub struct RecoveryManager;

impl RecoveryManager {
    /// Attempt recovery; never fails
    ///
    /// The record is fully decoded before any target is touched, so a corrupt
    /// file leaves fresh state intact.
    pub async fn recover(target: &CheckpointTarget, targets: RecoveryTargets<'_>) -> RecoveryOutcome {
        let store = match target {
            CheckpointTarget::Disabled(reason) => {
                return RecoveryOutcome::ColdStart(ColdStartReason::NotConfigured(*reason));
            }
            CheckpointTarget::Enabled(store) => store,
        };

        let path = store.describe();
        info!(path = %path, "Start recovery");

        let record = match store.read().await {
            Ok(record) => record,
            Err(Error::CheckpointNotFound { path }) => {
                return RecoveryOutcome::ColdStart(ColdStartReason::NotFound { path });
            }
            Err(e) if e.is_checkpoint_unusable() => {
                return RecoveryOutcome::ColdStart(ColdStartReason::Unreadable(e));
            }
            Err(e) => return RecoveryOutcome::ColdStart(ColdStartReason::StorageUnavailable(e)),
        };

        if let Err(e) = Self::rehydrate(&record, targets) {
            return RecoveryOutcome::ColdStart(ColdStartReason::Rehydrate(e));
        }

        RecoveryOutcome::Recovered {
            checkpoint_epoch: record.epoch,
            path,
        }
    }

    /// Load every section, restoring the previous state of all targets if any
    /// of them rejects its section
    fn rehydrate(record: &CheckpointRecord, targets: RecoveryTargets<'_>) -> runtime_core::Result<()> {
        let fresh = StateSnapshot::capture(&targets)?;
        let RecoveryTargets {
            model,
            optimizer,
            mut scheduler,
        } = targets;

        let scheduler_state = match (scheduler.is_some(), &record.scheduler_state) {
            (true, Some(state)) => Some(state),
            (true, None) => {
                warn!("Checkpoint has no lr_scheduler state, schedule restarts from step 0");
                None
            }
            (false, Some(_)) => {
                warn!("Checkpoint lr_scheduler state ignored, no schedule active");
                None
            }
            (false, None) => None,
        };

        let loaded = Self::load("model", model, &record.model_state)
            .and_then(|_| Self::load("optimizer", optimizer, &record.optimizer_state))
            .and_then(|_| match (scheduler.as_deref_mut(), scheduler_state) {
                (Some(s), Some(state)) => Self::load("lr_scheduler", s, state),
                _ => Ok(()),
            });

        if let Err(e) = loaded {
            let restored = fresh.restore(RecoveryTargets {
                model,
                optimizer,
                scheduler,
            });
            if let Err(restore_error) = restored {
                warn!(error = %restore_error, "Failed to restore fresh state after rejected checkpoint");
            }
            return Err(e);
        }
        Ok(())
    }

    fn load(component: &str, target: &mut (dyn Stateful + Send), state: &[u8]) -> runtime_core::Result<()> {
        target.load_state_dict(state).map_err(|e| Error::StateDict {
            component: component.to_string(),
            message: e.to_string(),
        })
    }
}
