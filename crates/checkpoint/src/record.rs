//! On-disk checkpoint record format
//!
//! ```text
//! magic "EPCK" | version u32 | epoch u64 | flags u8 | meta_len u32 | meta json
//! model_len u64 | model | optimizer_len u64 | optimizer | [scheduler_len u64 | scheduler]
//! ```
//!
//! All integers are little-endian. The scheduler section is present only when
//! the `FLAG_SCHEDULER` bit is set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use runtime_core::{Epoch, Error, Result, WorkerIdentity};
use serde::{Deserialize, Serialize};

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"EPCK";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

const FLAG_SCHEDULER: u8 = 0b0000_0001;

/// Fixed-size prefix: magic, version, epoch, flags, metadata length
const HEADER_LEN: usize = 4 + 4 + 8 + 1 + 4;

/// Snapshot of everything needed to resume training after `epoch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Epoch that had just finished when the record was taken
    pub epoch: Epoch,

    /// Opaque model state
    pub model_state: Bytes,

    /// Opaque optimizer state
    pub optimizer_state: Bytes,

    /// Opaque learning-rate schedule state, when a schedule is active
    pub scheduler_state: Option<Bytes>,
}

/// Descriptive metadata stored alongside a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMetadata {
    pub job_name: String,
    pub rank: u32,
    pub size: u32,
    pub created_at: DateTime<Utc>,
}

impl RecordMetadata {
    pub fn new(job_name: &str, identity: WorkerIdentity) -> Self {
        Self {
            job_name: job_name.to_string(),
            rank: identity.rank,
            size: identity.size,
            created_at: Utc::now(),
        }
    }
}

impl CheckpointRecord {
    /// Total payload size, excluding header and metadata
    pub fn payload_len(&self) -> usize {
        self.model_state.len()
            + self.optimizer_state.len()
            + self.scheduler_state.as_ref().map_or(0, Bytes::len)
    }

    /// Serialize the record with its metadata
    pub fn encode(&self, metadata: &RecordMetadata) -> Result<Bytes> {
        let metadata_json = serde_json::to_vec(metadata)?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + metadata_json.len() + 24 + self.payload_len());

        buf.put_slice(&CHECKPOINT_MAGIC);
        buf.put_u32_le(CHECKPOINT_VERSION);
        buf.put_u64_le(self.epoch);
        buf.put_u8(if self.scheduler_state.is_some() {
            FLAG_SCHEDULER
        } else {
            0
        });
        buf.put_u32_le(metadata_json.len() as u32);
        buf.put_slice(&metadata_json);

        put_section(&mut buf, &self.model_state);
        put_section(&mut buf, &self.optimizer_state);
        if let Some(scheduler) = &self.scheduler_state {
            put_section(&mut buf, scheduler);
        }

        Ok(buf.freeze())
    }

    /// Parse a record, reporting any structural problem as corruption of `path`
    pub fn decode(data: Bytes, path: &str) -> Result<(Self, RecordMetadata)> {
        let corrupted = |reason: String| Error::CheckpointCorrupted {
            path: path.to_string(),
            reason,
        };

        let mut buf = data;
        if buf.remaining() < HEADER_LEN {
            return Err(corrupted(format!(
                "truncated header ({} of {} bytes)",
                buf.remaining(),
                HEADER_LEN
            )));
        }

        let magic = buf.split_to(4);
        if magic[..] != CHECKPOINT_MAGIC {
            return Err(corrupted("invalid checkpoint magic".to_string()));
        }

        let version = buf.get_u32_le();
        if version != CHECKPOINT_VERSION {
            return Err(corrupted(format!(
                "unsupported format version {} (expected {})",
                version, CHECKPOINT_VERSION
            )));
        }

        let epoch = buf.get_u64_le();
        let flags = buf.get_u8();
        let metadata_len = buf.get_u32_le() as usize;

        let metadata_bytes = take(&mut buf, metadata_len, "metadata").map_err(&corrupted)?;
        let metadata: RecordMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| corrupted(format!("invalid metadata: {}", e)))?;

        let model_state = take_section(&mut buf, "model").map_err(&corrupted)?;
        let optimizer_state = take_section(&mut buf, "optimizer").map_err(&corrupted)?;
        let scheduler_state = if flags & FLAG_SCHEDULER != 0 {
            Some(take_section(&mut buf, "scheduler").map_err(&corrupted)?)
        } else {
            None
        };

        if buf.has_remaining() {
            return Err(corrupted(format!("{} trailing bytes", buf.remaining())));
        }

        let record = Self {
            epoch,
            model_state,
            optimizer_state,
            scheduler_state,
        };
        Ok((record, metadata))
    }
}

fn put_section(buf: &mut BytesMut, section: &Bytes) {
    buf.put_u64_le(section.len() as u64);
    buf.put_slice(section);
}

fn take(buf: &mut Bytes, len: usize, what: &str) -> std::result::Result<Bytes, String> {
    if buf.remaining() < len {
        return Err(format!(
            "truncated {} section ({} of {} bytes)",
            what,
            buf.remaining(),
            len
        ));
    }
    Ok(buf.split_to(len))
}

fn take_section(buf: &mut Bytes, what: &str) -> std::result::Result<Bytes, String> {
    if buf.remaining() < 8 {
        return Err(format!("missing {} section length", what));
    }
    let len = buf.get_u64_le();
    let len = usize::try_from(len).map_err(|_| format!("{} section too large", what))?;
    take(buf, len, what)
}
