//! In-process cohort
//!
//! Runs a whole cohort inside one process, one group handle per worker task.
//! Barriers and gathers are generation counted: the last arrival releases
//! every waiter and resets the state for the next round. A barrier round is
//! keyed by the label of its first arrival.

use async_trait::async_trait;
use parking_lot::Mutex;
use runtime_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::ProcessGroup;

/// Generation on release, or why the round failed
type Release = std::result::Result<u64, String>;

/// One barrier round
#[derive(Default)]
struct BarrierRound {
    generation: u64,
    label: Option<String>,
    arrived: u32,
    waiters: Vec<oneshot::Sender<Release>>,
}

impl BarrierRound {
    /// Close the round and hand every waiter the same result
    fn release(&mut self, result: Release) {
        let waiters: Vec<_> = self.waiters.drain(..).collect();
        self.arrived = 0;
        self.label = None;
        self.generation += 1;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// One all-gather round
struct GatherRound {
    generation: u64,
    slots: Vec<Option<f64>>,
    filled: u32,
    waiters: Vec<oneshot::Sender<Arc<Vec<f64>>>>,
}

struct Shared {
    size: u32,
    barrier: Mutex<BarrierRound>,
    gather: Mutex<GatherRound>,
}

/// Factory for the group handles of an in-process cohort
pub struct LocalCohort {
    groups: Vec<LocalProcessGroup>,
}

impl LocalCohort {
    /// Cohort of `size` workers on a single host
    pub fn new(size: u32) -> Self {
        Self::with_hosts(size, size.max(1))
    }

    /// Cohort of `size` workers spread over hosts of `workers_per_host`
    pub fn with_hosts(size: u32, workers_per_host: u32) -> Self {
        let shared = Arc::new(Shared {
            size,
            barrier: Mutex::new(BarrierRound::default()),
            gather: Mutex::new(GatherRound {
                generation: 0,
                slots: vec![None; size as usize],
                filled: 0,
                waiters: Vec::new(),
            }),
        });
        let per_host = workers_per_host.max(1);
        let groups = (0..size)
            .map(|rank| LocalProcessGroup {
                rank,
                local_rank: rank % per_host,
                shared: Arc::clone(&shared),
            })
            .collect();
        Self { groups }
    }

    /// Hand out the per-worker handles, ordered by rank
    pub fn into_groups(self) -> Vec<LocalProcessGroup> {
        self.groups
    }
}

/// A single worker's handle onto a [`LocalCohort`]
pub struct LocalProcessGroup {
    rank: u32,
    local_rank: u32,
    shared: Arc<Shared>,
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.shared.size
    }

    fn local_rank(&self) -> u32 {
        self.local_rank
    }

    async fn barrier(&self, label: &str) -> Result<()> {
        let rx = {
            let mut round = self.shared.barrier.lock();
            if let Some(expected) = round.label.as_deref() {
                if expected != label {
                    let message = format!(
                        "rank {} arrived at '{}' while the cohort waits at '{}'",
                        self.rank, label, expected
                    );
                    warn!(
                        rank = self.rank,
                        generation = round.generation,
                        barrier = label,
                        expected,
                        "Barrier label mismatch, failing round"
                    );
                    round.release(Err(message.clone()));
                    return Err(barrier_failed(message));
                }
            } else {
                round.label = Some(label.to_string());
            }

            round.arrived += 1;
            debug!(
                rank = self.rank,
                barrier = label,
                generation = round.generation,
                arrived = round.arrived,
                expected = self.shared.size,
                "Worker arrived at barrier"
            );

            if round.arrived >= self.shared.size {
                let generation = round.generation;
                round.release(Ok(generation));
                debug!(barrier = label, generation, "Barrier released");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            round.waiters.push(tx);
            rx
        };

        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(message)) => Err(barrier_failed(message)),
            Err(_) => Err(barrier_failed("cohort dropped before release".to_string())),
        }
    }

    async fn all_gather(&self, value: f64) -> Result<Vec<f64>> {
        let rx = {
            let mut round = self.shared.gather.lock();
            let index = self.rank as usize;
            if round.slots[index].is_some() {
                return Err(Error::Collective {
                    operation: "all_gather".to_string(),
                    message: format!("rank {} joined round {} twice", self.rank, round.generation),
                });
            }
            round.slots[index] = Some(value);
            round.filled += 1;

            if round.filled >= self.shared.size {
                let gathered: Vec<f64> = round.slots.iter_mut().filter_map(Option::take).collect();
                let gathered = Arc::new(gathered);
                let waiters: Vec<_> = round.waiters.drain(..).collect();
                round.filled = 0;
                round.generation += 1;
                for waiter in waiters {
                    let _ = waiter.send(Arc::clone(&gathered));
                }
                return Ok(gathered.as_ref().clone());
            }

            let (tx, rx) = oneshot::channel();
            round.waiters.push(tx);
            rx
        };

        rx.await
            .map(|gathered| gathered.as_ref().clone())
            .map_err(|_| Error::Collective {
                operation: "all_gather".to_string(),
                message: "cohort dropped before release".to_string(),
            })
    }
}

fn barrier_failed(message: String) -> Error {
    Error::Collective {
        operation: "barrier".to_string(),
        message,
    }
}
