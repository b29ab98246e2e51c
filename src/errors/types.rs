//! Error type definitions for the scheduler
//!
//! All errors use `thiserror` for trait implementations and chaining.

use crate::job_scheduling::state::State;
use crate::job_scheduling::JobId;
use thiserror::Error;

/// A requested job state change that the state machine does not allow.
///
/// The job's state is never modified when this error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal state transition from {from} to {to} for job {job_id}")]
pub struct IllegalStateTransition {
    pub job_id: JobId,
    pub from: State,
    pub to: State,
}

/// Top-level scheduler error type
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// State machine violations
    #[error(transparent)]
    IllegalStateTransition(#[from] IllegalStateTransition),

    /// The scheduler has not been started or has been stopped
    #[error("Scheduler {id} is not running")]
    NotRunning { id: String },

    /// `start` called twice
    #[error("Scheduler {id} is already running")]
    AlreadyRunning { id: String },

    /// `schedule` called for a job whose state is not admissible
    #[error("Cannot schedule job {job_id} in state {state}")]
    CannotSchedule { job_id: JobId, state: State },

    /// States only the scheduler itself may enter (RUNNING, READY)
    #[error("Job {job_id} cannot be moved to {state} from outside the scheduler")]
    ReservedState { job_id: JobId, state: State },

    /// The job is already owned by another scheduler
    #[error("Job {job_id} belongs to scheduler {attached}, not {requested}")]
    SchedulerMismatch {
        job_id: JobId,
        attached: String,
        requested: String,
    },

    /// No priority policy is registered under this name
    #[error("Unknown priority policy: {name}")]
    UnknownPolicy { name: String },

    /// Two schedulers registered with the same id
    #[error("Duplicate scheduler id: {id}")]
    DuplicateScheduler { id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persistence backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors reported by job storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record with this id
    #[error("Job not found: {id}")]
    NotFound { id: JobId },

    /// Backend specific failure
    #[error("Storage backend failure: {message}")]
    Backend { message: String },

    /// Record (de)serialization failures
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience methods for creating common error types
impl SchedulerError {
    /// Create a not-running error
    pub fn not_running<S: Into<String>>(id: S) -> Self {
        Self::NotRunning { id: id.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unknown policy error
    pub fn unknown_policy<S: Into<String>>(name: S) -> Self {
        Self::UnknownPolicy { name: name.into() }
    }
}

impl StorageError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}
