//! Error types for the epoch training loop

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every crate in the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Coordination errors
    #[error("Process group unavailable: {message}")]
    ProcessGroup { message: String },

    #[error("Invalid worker identity: rank {rank} is not below cohort size {size}")]
    InvalidIdentity { rank: u32, size: u32 },

    #[error("Barrier timeout: {barrier} (waited {timeout_ms}ms)")]
    BarrierTimeout { barrier: String, timeout_ms: u64 },

    #[error("Collective operation failed: {operation} - {message}")]
    Collective { operation: String, message: String },

    // Configuration errors
    #[error("Unknown data processer type: {name} (known: {known:?})")]
    UnknownDataProcesser { name: String, known: Vec<String> },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Failed to load {component} state: {message}")]
    StateDict { component: String, message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Errors raised by the model, optimizer or data collaborators
    #[error("{component} failed: {message}")]
    Collaborator { component: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error must abort the job.
    ///
    /// Cohort establishment and configuration problems cannot be recovered
    /// from on a single worker, so they are surfaced immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProcessGroup { .. }
                | Error::InvalidIdentity { .. }
                | Error::BarrierTimeout { .. }
                | Error::Collective { .. }
                | Error::UnknownDataProcesser { .. }
                | Error::InvalidConfig { .. }
        )
    }

    /// Returns true if this error means a checkpoint could not be used
    pub fn is_checkpoint_unusable(&self) -> bool {
        matches!(
            self,
            Error::CheckpointNotFound { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::StoragePathNotFound { .. }
                | Error::StateDict { .. }
        )
    }

    /// Shorthand for a collaborator failure
    pub fn collaborator(component: impl Into<String>, message: impl ToString) -> Self {
        Error::Collaborator {
            component: component.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
