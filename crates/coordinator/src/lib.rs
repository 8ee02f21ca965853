//! Cohort coordination for the epoch training loop
//!
//! This crate provides:
//! - **Process group contract**: rank, size, barrier and all-gather
//! - **Local cohort**: an in-process group for running several workers as tasks
//! - **Worker coordinator**: establishes a worker's identity and applies the
//!   configured timeout to every collective call
//!
//! # Example
//!
//! ```ignore
//! use coordinator::{LocalCohort, WorkerCoordinator};
//! use std::sync::Arc;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! for group in LocalCohort::new(4).into_groups() {
//!     tokio::spawn(async move {
//!         let coordinator = WorkerCoordinator::establish(Arc::new(group), None).await?;
//!         coordinator.barrier("epoch-0").await
//!     });
//! }
//! # Ok(())
//! # }
//! ```

pub mod local;
pub mod process_group;
pub mod worker;

pub use local::{LocalCohort, LocalProcessGroup};
pub use process_group::ProcessGroup;
pub use worker::WorkerCoordinator;
