//! Error types.
//!
//! Errors are split by where they surface during a job:
//!
//! | Type | Raised by | Effect on the job |
//! |------|-----------|-------------------|
//! | [`ResolutionError`] | [`resolve`](crate::resolver::resolve) | terminal, before any scan work |
//! | [`EngineError`] | [`ScanEngine::run`](crate::engine::ScanEngine::run) | terminal, never retried |
//! | [`StoreError`] | [`DocumentStore`](crate::store::DocumentStore) | logged; terminal writes are retried |
//! | [`ConfigError`] | [`ProcessConfig::load`](crate::config::ProcessConfig::load) | startup only |
//!
//! [`JobError`] is the umbrella a failed run carries into its `[BOT] Error:` log line.

use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

/// A job-input field could not be coerced or validated.
///
/// Every variant names the wire key of the offending field so the message
/// written to the job document points at what the submitter got wrong.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ResolutionError {
    /// Field is present but has the wrong type or an out-of-range value.
    #[error("invalid value for `{field}`: expected {expected}, found {found}")]
    InvalidField {
        /// Wire key of the field (e.g. `powerThreshold`).
        field: &'static str,
        /// Human-readable description of the accepted shape.
        expected: &'static str,
        /// Rendering of the rejected value.
        found: String,
    },

    /// Output-format selection names an identifier that is not recognized.
    #[error("invalid value for `formats`: unknown output format `{0}`")]
    UnknownFormat(String),

    /// Output-format selection has an unusable shape.
    #[error("invalid value for `formats`: {0}")]
    InvalidFormats(String),
}

impl ResolutionError {
    /// Wire key of the field that failed resolution.
    pub fn field(&self) -> &'static str {
        match self {
            Self::InvalidField { field, .. } => field,
            Self::UnknownFormat(_) | Self::InvalidFormats(_) => "formats",
        }
    }
}

/// Failure surfaced by a scan engine run.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The engine reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The engine task panicked.
    #[error("scan engine panicked: {0}")]
    Panicked(String),

    /// The run was cancelled by an operator or by shutdown.
    #[error("scan cancelled")]
    Cancelled,

    /// The run exceeded its configured timeout.
    #[error("scan timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl EngineError {
    /// Create a failure from any displayable message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Failure reading from or writing to the document store.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached (transient, retry).
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    /// The addressed document does not exist.
    #[error("job document not found: {0}")]
    NotFound(JobId),

    /// The store refused the mutation.
    #[error("document update rejected: {0}")]
    Rejected(String),

    /// The change feed could not be opened or broke.
    #[error("change feed error: {0}")]
    Subscription(String),
}

impl StoreError {
    /// Returns `true` if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Process configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or deserializing a configuration source failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// A loaded value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a job ended `failed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// The job's configuration could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The scan engine failed, panicked, or was stopped.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The document store refused an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for document store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for scan engine runs.
pub type EngineResult<T> = Result<T, EngineError>;
