pub mod config;
pub mod errors;
pub mod job_scheduling;
pub mod observability;
