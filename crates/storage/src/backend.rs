//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the whole object at `path`
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if nothing exists at `path`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace the object at `path`, creating parent directories as needed
    ///
    /// Returns the number of bytes written. The previous object, if any, is
    /// visible until the new one is complete.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Check if an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Human-readable location of `path`, used in logs
    fn describe(&self, path: &str) -> String;
}
