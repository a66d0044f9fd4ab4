use thiserror::Error;

use crate::browser::BrowserError;

/// Errors surfaced by the queue, worker, scheduler, login machine and solver.
///
/// Every variant is caught at the worker's per-task boundary and turned into
/// a `Failed` task; nothing here is allowed to end a background loop.
#[derive(Error, Debug)]
pub enum RpaError {
    /// Missing credentials, missing provider key, invalid timeouts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The solving service rejected the job (bad descriptor, no balance, ...).
    #[error("Provider error ({provider}): {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// The solving service never reported a ready token within the ceiling.
    #[error("Provider timeout ({provider}): no solution after {waited_secs}s")]
    ProviderTimeout {
        provider: &'static str,
        waited_secs: u64,
    },

    /// Transport-level failure talking to an external HTTP API. The request
    /// may have reached the remote side.
    #[error("Network error: {0}")]
    Network(String),

    /// The connection was never established, so the request was not sent.
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("Verification timeout: {0}")]
    VerificationTimeout(String),

    /// A human did not resolve the challenge within the manual-mode window.
    #[error("Challenge not resolved within {waited_secs}s")]
    ChallengeTimeout { waited_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// The outer per-task deadline elapsed before the task finished.
    #[error("Task exceeded its {0}s execution deadline")]
    TaskTimeout(u64),

    #[error("Extraction error: {0}")]
    Extraction(String),
}

/// Result type used across the crate
pub type RpaResult<T> = Result<T, RpaError>;

impl RpaError {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        RpaError::Provider {
            provider,
            message: message.into(),
        }
    }
}

impl From<BrowserError> for RpaError {
    fn from(err: BrowserError) -> Self {
        RpaError::Navigation(err.to_string())
    }
}

impl From<rusqlite::Error> for RpaError {
    fn from(err: rusqlite::Error) -> Self {
        RpaError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RpaError {
    fn from(err: serde_json::Error) -> Self {
        RpaError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RpaError {
    fn from(err: std::io::Error) -> Self {
        RpaError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for RpaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            RpaError::Unreachable(err.to_string())
        } else {
            RpaError::Network(err.to_string())
        }
    }
}
