//! Utility modules shared by the backup and restore pipelines.

pub mod errors;
pub mod logger;

pub use errors::{Result, StashError};

/// Run CPU or disk bound work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StashError::Task(e.to_string()))?
}
