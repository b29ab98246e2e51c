use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::job_scheduling::policy::PolicyRegistry;
use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_schedulers")]
    pub schedulers: Vec<SchedulerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit log lines as JSON
    #[serde(default = "default_log_json")]
    pub json: bool,
}

/// What happens to jobs found in RESTORED state after a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestorePolicy {
    /// Restored jobs are failed immediately
    Fail,
    /// Restored jobs are put back on the thread queue
    Restore,
    /// Restored jobs stay RESTORED until a client schedules them again
    #[default]
    WaitForUpdate,
}

/// Settings of one scheduler instance. Everything except `id` can also be
/// changed at runtime through the scheduler's setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_id")]
    pub id: String,

    /// Capacity of the thread queue and of the priority queue
    #[serde(default = "default_max_thread_queue_size")]
    pub max_thread_queue_size: usize,

    /// Capacity of the ready queue
    #[serde(default = "default_max_ready_queue_size")]
    pub max_ready_queue_size: usize,

    /// Maximum number of jobs in READY or TRANSFERRING
    #[serde(default = "default_max_ready_jobs")]
    pub max_ready_jobs: usize,

    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// Per-submitter running quota used by the fairness policy
    #[serde(default = "default_max_running_by_owner")]
    pub max_running_by_owner: usize,

    /// Scheduler-wide retry bound, combined with each job's own bound
    #[serde(default = "default_max_number_of_retries")]
    pub max_number_of_retries: u32,

    /// Delay before a job in RETRYWAIT is re-admitted
    #[serde(default = "default_retry_timeout", with = "duration_serde::duration")]
    pub retry_timeout: Duration,

    /// Longest time the control loop sleeps without being woken
    #[serde(
        default = "default_queues_update_max_wait",
        with = "duration_serde::duration"
    )]
    pub queues_update_max_wait: Duration,

    #[serde(default = "default_use_fairness")]
    pub use_fairness: bool,

    /// Name of a registered priority policy
    #[serde(default = "default_priority_policy")]
    pub priority_policy: String,

    #[serde(default)]
    pub restore_policy: RestorePolicy,

    /// Upper bound on waiting for a dispatched worker to take ownership
    #[serde(default = "default_startup_wait", with = "duration_serde::duration")]
    pub startup_wait: Duration,

    /// Pause before the next pass after the worker pool rejected a job
    #[serde(
        default = "default_rejection_backoff",
        with = "duration_serde::duration"
    )]
    pub rejection_backoff: Duration,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_log_json() -> bool {
    DEFAULT_LOG_JSON
}
fn default_schedulers() -> Vec<SchedulerConfig> {
    vec![SchedulerConfig::default()]
}
fn default_scheduler_id() -> String {
    DEFAULT_SCHEDULER_ID.to_string()
}
fn default_max_thread_queue_size() -> usize {
    DEFAULT_MAX_THREAD_QUEUE_SIZE
}
fn default_max_ready_queue_size() -> usize {
    DEFAULT_MAX_READY_QUEUE_SIZE
}
fn default_max_ready_jobs() -> usize {
    DEFAULT_MAX_READY_JOBS
}
fn default_thread_pool_size() -> usize {
    DEFAULT_THREAD_POOL_SIZE
}
fn default_max_running_by_owner() -> usize {
    DEFAULT_MAX_RUNNING_BY_OWNER
}
fn default_max_number_of_retries() -> u32 {
    DEFAULT_MAX_NUMBER_OF_RETRIES
}
fn default_retry_timeout() -> Duration {
    Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS)
}
fn default_queues_update_max_wait() -> Duration {
    Duration::from_secs(DEFAULT_QUEUES_UPDATE_MAX_WAIT_SECS)
}
fn default_use_fairness() -> bool {
    DEFAULT_USE_FAIRNESS
}
fn default_priority_policy() -> String {
    DEFAULT_PRIORITY_POLICY.to_string()
}
fn default_startup_wait() -> Duration {
    Duration::from_secs(DEFAULT_STARTUP_WAIT_SECS)
}
fn default_rejection_backoff() -> Duration {
    Duration::from_millis(DEFAULT_REJECTION_BACKOFF_MS)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            id: default_scheduler_id(),
            max_thread_queue_size: default_max_thread_queue_size(),
            max_ready_queue_size: default_max_ready_queue_size(),
            max_ready_jobs: default_max_ready_jobs(),
            thread_pool_size: default_thread_pool_size(),
            max_running_by_owner: default_max_running_by_owner(),
            max_number_of_retries: default_max_number_of_retries(),
            retry_timeout: default_retry_timeout(),
            queues_update_max_wait: default_queues_update_max_wait(),
            use_fairness: default_use_fairness(),
            priority_policy: default_priority_policy(),
            restore_policy: RestorePolicy::default(),
            startup_wait: default_startup_wait(),
            rejection_backoff: default_rejection_backoff(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            schedulers: default_schedulers(),
        }
    }
}

impl SchedulerConfig {
    /// Default settings under a different id
    pub fn with_id<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self, policies: &PolicyRegistry) -> SchedulerResult<()> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::configuration("scheduler id must not be empty"));
        }
        if self.thread_pool_size == 0 {
            return Err(SchedulerError::configuration(format!(
                "scheduler {}: thread_pool_size must be at least 1",
                self.id
            )));
        }
        if self.max_thread_queue_size == 0 || self.max_ready_queue_size == 0 {
            return Err(SchedulerError::configuration(format!(
                "scheduler {}: queue capacities must be at least 1",
                self.id
            )));
        }
        if self.max_running_by_owner == 0 {
            return Err(SchedulerError::configuration(format!(
                "scheduler {}: max_running_by_owner must be at least 1",
                self.id
            )));
        }
        if !policies.contains(&self.priority_policy) {
            return Err(SchedulerError::unknown_policy(&self.priority_policy));
        }
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }

    /// Check every scheduler section and reject duplicate ids
    pub fn validate(&self, policies: &PolicyRegistry) -> SchedulerResult<()> {
        let mut seen = HashSet::new();
        for scheduler in &self.schedulers {
            scheduler.validate(policies)?;
            if !seen.insert(scheduler.id.as_str()) {
                return Err(SchedulerError::DuplicateScheduler {
                    id: scheduler.id.clone(),
                });
            }
        }
        Ok(())
    }
}
