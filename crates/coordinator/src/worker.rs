//! Worker coordinator
//!
//! Establishes a worker's identity from its process group and wraps every
//! collective call with the job's barrier timeout. A timeout is a fatal cohort
//! failure; there is no retry because collective state cannot be partially
//! re-established.

use runtime_core::{Error, Result, WorkerIdentity};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::ProcessGroup;

pub struct WorkerCoordinator {
    group: Arc<dyn ProcessGroup>,
    identity: WorkerIdentity,
    timeout: Option<Duration>,
    barriers_passed: AtomicU64,
}

impl WorkerCoordinator {
    /// Read rank/size from the group, validate them and wait for the cohort
    pub async fn establish(group: Arc<dyn ProcessGroup>, timeout: Option<Duration>) -> Result<Self> {
        let (rank, size) = (group.rank(), group.size());
        if size == 0 {
            return Err(Error::ProcessGroup {
                message: "process group reports an empty cohort".to_string(),
            });
        }
        let identity = WorkerIdentity::new(rank, size, group.local_rank())?;

        let coordinator = Self {
            group,
            identity,
            timeout,
            barriers_passed: AtomicU64::new(0),
        };
        coordinator.barrier("coordinate").await?;

        info!(
            size = identity.size,
            rank = identity.rank,
            local_rank = identity.local_rank,
            "Coordinate workers finish"
        );
        Ok(coordinator)
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub fn is_main(&self) -> bool {
        self.identity.is_main()
    }

    /// Number of barriers this worker has passed
    pub fn barriers_passed(&self) -> u64 {
        self.barriers_passed.load(Ordering::Relaxed)
    }

    /// Wait for every worker at the barrier named `label`
    pub async fn barrier(&self, label: &str) -> Result<()> {
        debug!(rank = self.identity.rank, barrier = label, "Waiting for everyone");
        self.bounded(label, self.group.barrier(label)).await?;
        self.barriers_passed.fetch_add(1, Ordering::Relaxed);
        debug!(rank = self.identity.rank, barrier = label, "Barrier passed");
        Ok(())
    }

    /// Gather one value from every worker, ordered by rank
    pub async fn all_gather(&self, value: f64) -> Result<Vec<f64>> {
        let gathered = self.bounded("all_gather", self.group.all_gather(value)).await?;
        if gathered.len() != self.identity.size as usize {
            return Err(Error::Collective {
                operation: "all_gather".to_string(),
                message: format!(
                    "expected {} values, got {}",
                    self.identity.size,
                    gathered.len()
                ),
            });
        }
        Ok(gathered)
    }

    async fn bounded<T, F>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            None => operation.await,
            Some(timeout) => tokio::time::timeout(timeout, operation)
                .await
                .map_err(|_| Error::BarrierTimeout {
                    barrier: label.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })?,
        }
    }
}
