//! Process group contract

use async_trait::async_trait;
use runtime_core::Result;

/// Collective operations over the job cohort
///
/// Every call is all-participate: a barrier or gather completes only once
/// every rank has made the matching call.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Global index of this worker
    fn rank(&self) -> u32;

    /// Number of workers in the cohort
    fn size(&self) -> u32;

    /// Index of this worker on its host
    fn local_rank(&self) -> u32;

    /// Block until every worker reaches the barrier named `label`
    ///
    /// Every arrival in one round must carry the same label; a worker that
    /// arrives at a different barrier fails the round for the whole cohort.
    async fn barrier(&self, label: &str) -> Result<()>;

    /// Exchange one value with every worker; the result is ordered by rank
    async fn all_gather(&self, value: f64) -> Result<Vec<f64>>;
}
