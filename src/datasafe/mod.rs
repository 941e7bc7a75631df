pub mod file;
pub mod nil;
pub mod postgres;
pub mod registry;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use registry::DataSafeRegistry;

/// Errors reported by a storage backend.
#[derive(Debug, Error)]
pub enum DataSafeError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("data safe already configured")]
    AlreadyConfigured,

    #[error("data safe used before it was configured")]
    NotConfigured,

    #[error("invalid data safe configuration: {0}")]
    InvalidConfig(String),

    #[error("key is too long ({len} bytes, max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Backend for durable storage of session content.
///
/// All methods must be safe to call concurrently from any task.
/// `load` returns an empty string for keys that were never saved, and callers
/// treat an `Err` from `load` exactly like an empty value.
#[async_trait]
pub trait DataSafe: Send + Sync {
    /// Store `data` under `key`. Best-effort: returning `Ok` does not mean the
    /// data already reached the medium.
    async fn save(&self, key: &str, data: &str) -> Result<(), DataSafeError>;

    /// Load the data stored under `key`.
    async fn load(&self, key: &str) -> Result<String, DataSafeError>;

    /// One-time setup with the backend specific configuration string.
    async fn configure(&self, config: &str) -> Result<(), DataSafeError>;

    /// Whether saved content survives a restart.
    fn is_durable(&self) -> bool;

    /// Block until every save issued before this call is applied, then release
    /// the backend.
    async fn flush_and_close(&self);
}
