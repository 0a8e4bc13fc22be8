//! Custom error types for coldstash.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Safety abort: {0}")]
    SafetyAbort(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("RestoreAlreadyInProgress: {0}")]
    RestoreAlreadyInProgress(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{label} failed after {elapsed:?} of retries: {source}")]
    RetryExhausted {
        label: String,
        elapsed: Duration,
        #[source]
        source: Box<StashError>,
    },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Incomplete(String),
}

/// Lower-cased fragments that mark an error message as a transient network fault.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "dns",
    "name resolution",
    "no route to host",
    "network is unreachable",
    "temporary",
    "temporarily unavailable",
    "slow down",
    "service unavailable",
];

impl StashError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// The category decides first: authentication, validation, safety and
    /// local format problems never retry. Everything else falls back to
    /// inspecting the message text.
    pub fn is_transient(&self) -> bool {
        match self {
            StashError::Network(_) => true,
            StashError::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::TimedOut
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::Interrupted
                ) || message_is_transient(&e.to_string())
            }
            StashError::Authentication(_)
            | StashError::Validation(_)
            | StashError::Config(_)
            | StashError::SafetyAbort(_)
            | StashError::Decryption(_)
            | StashError::Format(_)
            | StashError::NotFound { .. }
            | StashError::RestoreAlreadyInProgress(_)
            | StashError::Cancelled
            | StashError::RetryExhausted { .. }
            | StashError::Serialization(_)
            | StashError::Task(_)
            | StashError::Incomplete(_) => false,
        }
    }
}

fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

pub type Result<T> = std::result::Result<T, StashError>;
