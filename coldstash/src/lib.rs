//! coldstash library
//!
//! Archives local file trees, optionally encrypts and chunks them, ships them
//! to an object store and reverses the process on restore, including the
//! archival-tier retrieval workflow.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod executor;
pub mod fs;
pub mod ledger;
pub mod prompt;
pub mod restore;
pub mod retry;
pub mod shutdown;
pub mod split;
pub mod store;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use config::AppConfig;
pub use utils::errors::{Result, StashError};
