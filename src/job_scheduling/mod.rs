//! Job scheduling subsystem
//!
//! Jobs are admitted into bounded queues, selected fairly among their
//! submitters, executed on a bounded worker pool, retried after transient
//! failures and tracked through a strict state machine until they end in
//! DONE, CANCELED or FAILED.
//!
//! The system is built around these components:
//! - `Job`: the scheduled entity and its lock-guarded state machine
//! - `JobQueue`: bounded FIFO with fairness-aware selection
//! - `StageCounters`: per-submitter counts for every pipeline stage
//! - `Scheduler`: admission, control loop, retries and runtime settings
//! - `WorkerPool`: fixed set of workers that rejects instead of queueing
//! - `SchedulerRegistry`: the configured schedulers, looked up by id

pub mod counters;
pub mod job;
pub mod job_executor;
pub mod job_queue;
pub mod job_scheduler;
pub mod policy;
pub mod registry;
pub mod state;
pub mod storage;
pub mod timer;
pub mod types;

pub use counters::{CreatorCounters, Stage, StageCounters};
pub use job::{
    Completion, Job, JobAction, JobBuilder, JobContext, JobGuard, JobHistoryEntry, JobId,
    JobOutcome, JobRecord, action_fn,
};
pub use job_executor::WorkerPool;
pub use job_queue::{JobQueue, ValueCalculator};
pub use job_scheduler::Scheduler;
pub use policy::{FairSharePolicy, FifoPolicy, JobPriorityPolicy, PolicyRegistry};
pub use registry::{SchedulerRegistry, SchedulerRegistryBuilder};
pub use state::State;
pub use storage::{InMemoryJobStorage, JobStorage};
pub use timer::{JobTimer, TimerHandle};
pub use types::*;
