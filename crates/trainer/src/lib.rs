//! Trainer - epoch training loop for a cohort of cooperating workers
//!
//! Each worker runs the same loop: coordinate, recover from its own
//! checkpoint, then train, evaluate, checkpoint and meet the cohort at a
//! barrier once per epoch. Model, optimizer and data are supplied through the
//! traits in [`collaborators`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coordinator::LocalCohort;
//! use runtime_core::JobConfig;
//! use trainer::synthetic::{synthetic_registry, LinearTarget, SgdOptimizer, SyntheticModel};
//! use trainer::Trainer;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let config = JobConfig::from_file("job.json")?;
//! let trainer = Trainer::new(config, &synthetic_registry())?;
//! let group = LocalCohort::new(1).into_groups().remove(0);
//! let mut ctx = trainer
//!     .prepare(Arc::new(group), SyntheticModel::default(), SgdOptimizer::new(0.1), &(), LinearTarget::default())
//!     .await?;
//! let summary = trainer.run(&mut ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod context;
pub mod metrics;
pub mod observer;
pub mod processer;
pub mod schedule;
pub mod synthetic;
mod trainer;

pub use collaborators::{
    DataProcesser, DataSource, Model, ModelMode, Optimizer, PreparedData, ProcesserFactory,
    VecSource,
};
pub use context::WorkerContext;
pub use metrics::{perplexity, EvalMetrics};
pub use observer::{LoopEvent, LoopObserver, NoopObserver};
pub use processer::DataProcesserRegistry;
pub use schedule::Schedule;
pub use trainer::{Trainer, TrainingSummary, ARTIFACT_FILE};
