use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::info;

use crate::job_scheduling::state::State;

/// Install a local meter provider as the global one.
///
/// The library only records through the global meter; binaries call this once
/// at startup and keep the provider alive until shutdown.
pub fn init_metrics() -> SdkMeterProvider {
    let provider = SdkMeterProvider::builder().build();
    global::set_meter_provider(provider.clone());
    info!("OpenTelemetry configured: local metrics only");
    provider
}

/// Metric instruments of one scheduler instance
#[derive(Clone)]
pub struct SchedulerMetrics {
    scheduler: KeyValue,
    jobs_scheduled: Counter<u64>,
    admission_rejections: Counter<u64>,
    state_transitions: Counter<u64>,
    job_retries: Counter<u64>,
    pool_rejections: Counter<u64>,
    job_duration: Histogram<f64>,
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics")
            .field("scheduler", &self.scheduler.value)
            .finish_non_exhaustive()
    }
}

impl SchedulerMetrics {
    /// Build the instruments from the global meter
    pub fn new(scheduler_id: &str) -> Self {
        Self::with_meter(global::meter("srm-scheduler"), scheduler_id)
    }

    pub fn with_meter(meter: Meter, scheduler_id: &str) -> Self {
        let jobs_scheduled = meter
            .u64_counter("srm_scheduler_jobs_scheduled_total")
            .with_description("Jobs accepted onto an admission queue")
            .build();
        let admission_rejections = meter
            .u64_counter("srm_scheduler_admission_rejections_total")
            .with_description("Jobs failed at admission because a queue was full")
            .build();
        let state_transitions = meter
            .u64_counter("srm_scheduler_state_transitions_total")
            .with_description("Job state transitions by target state")
            .build();
        let job_retries = meter
            .u64_counter("srm_scheduler_job_retries_total")
            .with_description("Jobs parked in RETRYWAIT after a recoverable failure")
            .build();
        let pool_rejections = meter
            .u64_counter("srm_scheduler_pool_rejections_total")
            .with_description("Dispatch attempts rejected by a saturated worker pool")
            .build();
        let job_duration = meter
            .f64_histogram("srm_scheduler_job_duration_seconds")
            .with_description("Time spent inside job actions")
            .build();

        Self {
            scheduler: KeyValue::new("scheduler", scheduler_id.to_string()),
            jobs_scheduled,
            admission_rejections,
            state_transitions,
            job_retries,
            pool_rejections,
            job_duration,
        }
    }

    pub fn record_scheduled(&self) {
        self.jobs_scheduled.add(1, &[self.scheduler.clone()]);
    }

    pub fn record_admission_rejection(&self, queue: &'static str) {
        self.admission_rejections
            .add(1, &[self.scheduler.clone(), KeyValue::new("queue", queue)]);
    }

    pub fn record_transition(&self, state: State) {
        self.state_transitions.add(
            1,
            &[self.scheduler.clone(), KeyValue::new("state", state.to_string())],
        );
        if state == State::RetryWait {
            self.job_retries.add(1, &[self.scheduler.clone()]);
        }
    }

    pub fn record_pool_rejection(&self) {
        self.pool_rejections.add(1, &[self.scheduler.clone()]);
    }

    pub fn record_job_duration(&self, seconds: f64) {
        self.job_duration.record(seconds, &[self.scheduler.clone()]);
    }
}
