//! Storage - backends for checkpoint bundles and model artifacts
//!
//! Paths handed to a backend are relative to its root. Writes are atomic, so
//! a reader never observes a half-written checkpoint.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("job_0-of-2/checkpoint.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("job_0-of-2/checkpoint.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
