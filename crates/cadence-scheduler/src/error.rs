//! Error types for the scheduler.

use thiserror::Error;

use crate::types::JobKind;

/// Failure reported by an external collaborator (store, generator, publisher, notifier).
///
/// The variant decides how the job queue treats the failure: transient and
/// rate-limited errors are retried, everything else fails the job outright.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Network error, timeout or 5xx. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote side asked us to slow down.
    #[error("rate limited by remote (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// Missing credentials, malformed input. Retrying cannot fix it.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The write would duplicate an existing record.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A schedule row could not be interpreted.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Job payload did not match its kind.
    #[error("invalid payload for {kind} job: {message}")]
    InvalidPayload { kind: JobKind, message: String },

    /// No handler is registered for the job kind.
    #[error("no handler registered for job kind {0}")]
    UnknownJobKind(JobKind),

    /// Local admission control denied the request.
    #[error("rate limit exceeded for {key} (retry after {retry_after_secs}s)")]
    RateLimited { key: String, retry_after_secs: u64 },

    /// The circuit for a dependency is open and no fallback was available.
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    /// A collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The post went out but the store never recorded it.
    #[error("post {post_id} published as {remote_id} but not recorded: {message}")]
    UnrecordedPublish {
        post_id: String,
        remote_id: String,
        message: String,
    },

    /// The scheduler was dropped while a job still referenced it.
    #[error("scheduler is not running")]
    NotRunning,

    /// A job handler panicked.
    #[error("job handler panicked")]
    HandlerPanicked,
}

impl SchedulerError {
    /// Whether the job queue should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::RateLimited { .. } => true,
            SchedulerError::Collaborator(CollaboratorError::Transient(_)) => true,
            SchedulerError::Collaborator(CollaboratorError::RateLimited { .. }) => true,
            SchedulerError::HandlerPanicked => true,
            _ => false,
        }
    }

    /// Server- or limiter-supplied hint for when to try again.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SchedulerError::RateLimited {
                retry_after_secs, ..
            }
            | SchedulerError::Collaborator(CollaboratorError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
