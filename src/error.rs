//! Error types for rfp-agent.
//!
//! Each subsystem owns a `thiserror` enum. Per-section failures
//! ([`RetrievalError`], [`ProviderError`]) are recorded on the section and
//! never abort a run; [`CheckpointError`] is fatal to the run that hit it.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::SectionStatus;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Retrieval failure.
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// Generation backend failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Checkpoint store failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Input document failure.
    #[error(transparent)]
    Input(#[from] InputError),

    /// Orchestration failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// CLI command failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the retrieval client and the vector store behind it.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The store could not be reached after the retry policy was exhausted.
    #[error("retrieval unavailable after {attempts} attempt(s): {message}")]
    Unavailable {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last underlying failure.
        message: String,
    },

    /// A single store call failed in a way worth retrying.
    #[error("transient store failure: {message}")]
    Transient {
        /// Failure detail.
        message: String,
    },

    /// The request itself was invalid (e.g. `max_passages == 0`).
    #[error("invalid retrieval request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },

    /// The query could not be embedded.
    #[error("embedding failed: {message}")]
    Embedding {
        /// Failure detail.
        message: String,
    },

    /// The pass was cancelled before the store answered.
    #[error("retrieval cancelled")]
    Cancelled,
}

impl RetrievalError {
    /// Whether the retry policy should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<rusqlite::Error> for RetrievalError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Transient {
            message: err.to_string(),
        }
    }
}

/// Errors raised by generation backends.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout, rate limit, 5xx, or connection failure.
    #[error("transient provider error{}: {message}", status_suffix(.status))]
    Transient {
        /// Failure detail.
        message: String,
        /// HTTP status, when there was one.
        status: Option<u16>,
    },

    /// Malformed request, authentication failure, or content policy rejection.
    #[error("permanent provider error{}: {message}", status_suffix(.status))]
    Permanent {
        /// Failure detail.
        message: String,
        /// HTTP status, when there was one.
        status: Option<u16>,
    },

    /// Transient failures persisted past the retry ceiling.
    #[error("provider unavailable after {attempts} attempt(s): {last}")]
    Unavailable {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last transient failure.
        last: String,
    },

    /// No backend is registered for the requested provider.
    #[error("no backend registered for provider '{name}'")]
    UnsupportedProvider {
        /// Provider name.
        name: String,
    },

    /// A backend needs an API key that was not configured.
    #[error("API key missing: set OPENAI_API_KEY or RFP_API_KEY")]
    ApiKeyMissing,

    /// The pass was cancelled before the backend produced an answer.
    #[error("generation cancelled")]
    Cancelled,
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ProviderError {
    /// Whether the retry policy should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classifies an HTTP status into transient or permanent.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 408 || status == 429 || status >= 500 {
            Self::Transient {
                message,
                status: Some(status),
            }
        } else {
            Self::Permanent {
                message,
                status: Some(status),
            }
        }
    }
}

/// A generated compliance answer did not resolve to exactly one label.
///
/// Never fatal: the classifier turns it into a low-confidence `PARTIAL`.
#[derive(Debug, Error)]
#[error("could not resolve a verdict from {line:?}")]
pub struct ClassificationAmbiguous {
    /// The line that was inspected.
    pub line: String,
}

/// Errors raised by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Durable write failed. Fatal to the current run.
    #[error("checkpoint write failed: {message}")]
    WriteFailure {
        /// Failure detail.
        message: String,
    },

    /// Reading the log failed.
    #[error("checkpoint read failed: {message}")]
    Read {
        /// Failure detail.
        message: String,
    },

    /// A stored record could not be decoded.
    #[error("corrupt checkpoint record {seq}: {message}")]
    Corrupt {
        /// Write sequence of the offending record.
        seq: i64,
        /// Decode failure.
        message: String,
    },

    /// No header exists for the run.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// Requested run.
        run_id: String,
    },

    /// The run was abandoned by an operator and cannot be resumed.
    #[error("run {run_id} was abandoned")]
    RunAbandoned {
        /// Abandoned run.
        run_id: String,
    },
}

/// An illegal section status transition was requested.
#[derive(Debug, Error)]
#[error("section {section_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    /// Section being transitioned.
    pub section_id: String,
    /// Current status.
    pub from: SectionStatus,
    /// Requested status.
    pub to: SectionStatus,
}

/// Configuration load and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The file is not valid TOML or contains unrecognized options.
    #[error("invalid config {}: {message}", .path.display())]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Parser message (names unknown keys).
        message: String,
    },

    /// A value is out of range.
    #[error("invalid value for '{key}': {message}")]
    Invalid {
        /// Option name.
        key: &'static str,
        /// What was wrong.
        message: String,
    },

    /// An environment variable held a value that does not parse.
    #[error("invalid value for {var}={value:?}: {message}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        message: String,
    },
}

/// Input document errors.
#[derive(Debug, Error)]
pub enum InputError {
    /// The input format could not be determined or is unsupported.
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    /// The document was read but is malformed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The document produced no sections.
    #[error("no sections found in {0}")]
    Empty(String),

    /// Two sections share an id.
    #[error("duplicate section id: {0}")]
    DuplicateId(String),
}

impl From<csv::Error> for InputError {
    fn from(err: csv::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for InputError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Run-level orchestration errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Checkpointing failed; the run stopped and remains resumable.
    #[error("run {run_id} stopped: {source}")]
    Checkpoint {
        /// Affected run.
        run_id: String,
        /// Underlying store failure.
        #[source]
        source: CheckpointError,
    },

    /// The sections handed to the orchestrator are unusable.
    #[error("invalid run: {message}")]
    InvalidRun {
        /// What was wrong.
        message: String,
    },

    /// A section state machine violation (indicates a bug).
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {message}")]
    Worker {
        /// Join failure detail.
        message: String,
    },
}

/// CLI command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Command execution failed.
    #[error("command failed: {0}")]
    ExecutionFailed(String),

    /// Output formatting failed.
    #[error("output format error: {0}")]
    OutputFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(503, "busy").is_transient());
        assert!(ProviderError::from_status(408, "timeout").is_transient());
        assert!(!ProviderError::from_status(401, "auth").is_transient());
        assert!(!ProviderError::from_status(400, "bad").is_transient());
    }

    #[test]
    fn test_provider_error_display_includes_status() {
        let err = ProviderError::from_status(503, "overloaded");
        assert_eq!(
            err.to_string(),
            "transient provider error (HTTP 503): overloaded"
        );
        let err = ProviderError::Permanent {
            message: "bad prompt".to_string(),
            status: None,
        };
        assert_eq!(err.to_string(), "permanent provider error: bad prompt");
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            section_id: "s0001".to_string(),
            from: SectionStatus::Done,
            to: SectionStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "section s0001: illegal transition done -> pending"
        );
    }
}
