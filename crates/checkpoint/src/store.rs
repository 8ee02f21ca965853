//! Rank-scoped checkpoint store
//!
//! Every rank owns one directory, `{root}/{job_name}_{rank}-of-{size}/`, and
//! overwrites the single record inside it at the end of each epoch. Ranks
//! never share a path, so writes need no coordination.

use bytes::Bytes;
use runtime_core::{CheckpointPolicy, Error, Result, WorkerIdentity};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use storage::{LocalStorage, StorageBackend};
use tracing::{info, instrument};

use crate::record::{CheckpointRecord, RecordMetadata};

/// File name of the record inside a rank directory
pub const CHECKPOINT_FILE: &str = "checkpoint.ckpt";

/// Why checkpointing is not available for this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unconfigured {
    /// No checkpoint section in the job config
    NoPolicy,

    /// Checkpoint section without `root_path`
    MissingRootPath,

    /// Checkpoint section without `model_name`
    MissingModelName,
}

impl fmt::Display for Unconfigured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unconfigured::NoPolicy => f.write_str("checkpoint is not configured"),
            Unconfigured::MissingRootPath => f.write_str("checkpoint root_path is empty"),
            Unconfigured::MissingModelName => f.write_str("checkpoint model_name is empty"),
        }
    }
}

/// Resolved rank-scoped location of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLocation {
    root: PathBuf,
    job_name: String,
    identity: WorkerIdentity,
}

impl CheckpointLocation {
    /// Resolve the location from the job's policy
    pub fn resolve(
        policy: Option<&CheckpointPolicy>,
        identity: WorkerIdentity,
    ) -> std::result::Result<Self, Unconfigured> {
        let policy = policy.ok_or(Unconfigured::NoPolicy)?;
        let root = policy
            .root_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(Unconfigured::MissingRootPath)?;
        let job_name = policy
            .model_name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(Unconfigured::MissingModelName)?;
        Ok(Self {
            root,
            job_name,
            identity,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Directory name owned by this rank, e.g. `gpt_1-of-4`
    pub fn directory_name(&self) -> String {
        format!("{}_{}", self.job_name, self.identity)
    }

    /// Full path of this rank's directory
    pub fn directory(&self) -> PathBuf {
        self.root.join(self.directory_name())
    }

    /// Record path relative to the root
    pub fn record_path(&self) -> String {
        format!("{}/{}", self.directory_name(), CHECKPOINT_FILE)
    }
}

/// Reads and writes this rank's checkpoint record
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
    location: CheckpointLocation,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Create a store over an explicit backend rooted at the location's root
    pub fn new(backend: Arc<dyn StorageBackend>, location: CheckpointLocation) -> Self {
        Self { backend, location }
    }

    /// Create a store on the local filesystem
    pub fn local(location: CheckpointLocation) -> Self {
        let backend = Arc::new(LocalStorage::new(location.root()));
        Self::new(backend, location)
    }

    pub fn location(&self) -> &CheckpointLocation {
        &self.location
    }

    /// Human-readable path of the record
    pub fn describe(&self) -> String {
        self.backend.describe(&self.location.record_path())
    }

    /// Write the record, replacing any previous one
    #[instrument(skip(self, record), fields(path = %self.describe(), epoch = record.epoch))]
    pub async fn write(&self, record: &CheckpointRecord) -> Result<u64> {
        let start = Instant::now();
        let metadata = RecordMetadata::new(self.location.job_name(), self.location.identity);
        let encoded = record.encode(&metadata)?;

        let size = self
            .backend
            .write(&self.location.record_path(), encoded)
            .await
            .map_err(|e| Error::CheckpointWriteFailed {
                message: format!("{}: {}", self.describe(), e),
            })?;

        let elapsed = start.elapsed();
        info!(
            size_bytes = size,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
            "Checkpoint write complete"
        );
        Ok(size)
    }

    /// Read and decode the record
    ///
    /// A missing record is `CheckpointNotFound`; anything undecodable is
    /// `CheckpointCorrupted`.
    #[instrument(skip(self), fields(path = %self.describe()))]
    pub async fn read(&self) -> Result<CheckpointRecord> {
        let path = self.describe();
        let data: Bytes = match self.backend.read(&self.location.record_path()).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::CheckpointNotFound { path });
            }
            Err(e) => return Err(e),
        };

        let (record, metadata) = CheckpointRecord::decode(data, &path)?;
        if metadata.rank != self.location.identity.rank || metadata.size != self.location.identity.size {
            return Err(Error::CheckpointCorrupted {
                path,
                reason: format!(
                    "record belongs to rank {}-of-{}",
                    metadata.rank, metadata.size
                ),
            });
        }
        Ok(record)
    }

    /// Check whether a record has been written
    pub async fn exists(&self) -> Result<bool> {
        self.backend.exists(&self.location.record_path()).await
    }
}

/// Result of a checkpoint save attempt
#[derive(Debug)]
pub enum SaveOutcome {
    /// Record written
    Saved { path: String, size_bytes: u64 },

    /// Checkpointing is not configured for this run
    Skipped(Unconfigured),

    /// The write failed; the previous record, if any, is intact
    Failed(Error),
}

/// Checkpoint destination as resolved for this worker
#[derive(Debug, Clone)]
pub enum CheckpointTarget {
    Enabled(CheckpointStore),
    Disabled(Unconfigured),
}

impl CheckpointTarget {
    /// Resolve the target on the local filesystem
    pub fn resolve(policy: Option<&CheckpointPolicy>, identity: WorkerIdentity) -> Self {
        match CheckpointLocation::resolve(policy, identity) {
            Ok(location) => CheckpointTarget::Enabled(CheckpointStore::local(location)),
            Err(reason) => CheckpointTarget::Disabled(reason),
        }
    }

    /// True when the job config has a checkpoint section at all
    pub fn is_configured(&self) -> bool {
        !matches!(self, CheckpointTarget::Disabled(Unconfigured::NoPolicy))
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        match self {
            CheckpointTarget::Enabled(store) => Some(store),
            CheckpointTarget::Disabled(_) => None,
        }
    }

    /// Save a record; never returns an error, the outcome carries it
    pub async fn save(&self, record: &CheckpointRecord) -> SaveOutcome {
        match self {
            CheckpointTarget::Disabled(reason) => SaveOutcome::Skipped(*reason),
            CheckpointTarget::Enabled(store) => match store.write(record).await {
                Ok(size_bytes) => SaveOutcome::Saved {
                    path: store.describe(),
                    size_bytes,
                },
                Err(e) => SaveOutcome::Failed(e),
            },
        }
    }
}
