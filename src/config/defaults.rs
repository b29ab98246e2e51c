/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_JSON: bool = false;

// Scheduler identity
pub const DEFAULT_SCHEDULER_ID: &str = "default";

// Queue capacities
pub const DEFAULT_MAX_THREAD_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_MAX_READY_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_MAX_READY_JOBS: usize = 60;

// Worker pool and quotas
pub const DEFAULT_THREAD_POOL_SIZE: usize = 30;
pub const DEFAULT_MAX_RUNNING_BY_OWNER: usize = 10;

// Retries
pub const DEFAULT_MAX_NUMBER_OF_RETRIES: u32 = 20;
pub const DEFAULT_JOB_MAX_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 60;

// Control loop
pub const DEFAULT_QUEUES_UPDATE_MAX_WAIT_SECS: u64 = 60;
pub const DEFAULT_STARTUP_WAIT_SECS: u64 = 10;
pub const DEFAULT_REJECTION_BACKOFF_MS: u64 = 0;

// Selection
pub const DEFAULT_USE_FAIRNESS: bool = true;
pub const DEFAULT_PRIORITY_POLICY: &str = "default";
