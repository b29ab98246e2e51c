//! Centralized error handling for the scheduler
//!
//! This module provides the error taxonomy shared by every layer of the
//! job scheduling core.
//!
//! # Error Categories
//!
//! - **Illegal state transitions**: a requested transition is not part of the
//!   job state machine; always caught at the call site and logged
//! - **Scheduler errors**: lifecycle misuse, admission of jobs in the wrong
//!   state, unknown priority policies, configuration problems
//! - **Storage errors**: failures reported by a [`JobStorage`] backend
//!
//! Failures of a job's own action are not errors in this sense: they are
//! reported as a [`JobOutcome`] and drive the job to RETRYWAIT or FAILED.
//!
//! [`JobStorage`]: crate::job_scheduling::JobStorage
//! [`JobOutcome`]: crate::job_scheduling::JobOutcome
//!
//! # Usage
//!
//! ```rust
//! use srm_scheduler::errors::{SchedulerError, SchedulerResult};
//!
//! fn example_function() -> SchedulerResult<()> {
//!     Err(SchedulerError::not_running("transfers"))
//! }
//!
//! assert!(example_function().is_err());
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using SchedulerError
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Convenience type alias for storage Results
pub type StorageResult<T> = Result<T, StorageError>;
