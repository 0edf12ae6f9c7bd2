//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The generation backend cannot accept work (missing credentials).
    #[error("Generation backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Transport failure while submitting a job.
    #[error("Submission error: {0}")]
    Submission(String),

    /// Transport failure while polling a job.
    #[error("Poll error: {0}")]
    Poll(String),

    /// The backend reported the job as failed.
    #[error("Job failed: {reason}")]
    JobFailed { reason: String },

    /// A result was requested before the job completed.
    #[error("Result not ready for job {0}")]
    ResultNotReady(String),

    /// Step output could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Output violates a length constraint.
    #[error("Validation error: {field} is {actual} chars, limit is {limit}")]
    Validation {
        field: String,
        limit: usize,
        actual: usize,
    },

    /// Record counts across steps disagree.
    #[error("Consistency error: expected {expected} records, got {actual}")]
    Consistency { expected: usize, actual: usize },

    /// Poll budget exhausted without a terminal status.
    #[error("Timed out waiting for job {0}")]
    Timeout(String),

    /// The same step is already in flight for the work item.
    #[error("Step {step} already in flight for work item {work_item_id}")]
    StepInFlight { work_item_id: String, step: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// Caller input rejected before any work started.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn job_failed(reason: impl Into<String>) -> Self {
        Self::JobFailed {
            reason: reason.into(),
        }
    }

    pub fn validation(field: impl Into<String>, limit: usize, actual: usize) -> Self {
        Self::Validation {
            field: field.into(),
            limit,
            actual,
        }
    }
}
