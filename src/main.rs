use anyhow::Result;
use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use srm_scheduler::{
    config::Config,
    job_scheduling::{
        InMemoryJobStorage, Job, JobAction, JobOutcome, JobStorage, PolicyRegistry,
        SchedulerRegistry, action_fn,
    },
    observability::init_metrics,
};

#[derive(Parser)]
#[command(name = "srm-scheduler")]
#[command(version)]
#[command(about = "Job scheduler for storage resource manager requests")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (overrides config file)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Number of synthetic jobs to submit to every scheduler
    #[arg(long, default_value_t = 0)]
    demo_jobs: usize,

    /// Number of distinct submitters the synthetic jobs are spread over
    #[arg(long, default_value_t = 3)]
    demo_submitters: usize,

    /// Print scheduler statistics as JSON on shutdown
    #[arg(long)]
    json: bool,
}

fn init_logging(level: &str, json: bool) {
    let log_filter = format!("srm_scheduler={level}");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Sleeps for a random while and then succeeds, stages its result or fails
fn demo_action() -> Arc<dyn JobAction> {
    action_fn(|ctx| async move {
        let (work, roll) = {
            let mut rng = rand::rng();
            (
                Duration::from_millis(rng.random_range(50..500)),
                rng.random_range(0..100u32),
            )
        };
        tokio::select! {
            _ = ctx.cancelled() => return JobOutcome::fatal("canceled while running"),
            _ = tokio::time::sleep(work) => {}
        }
        match roll {
            0..60 => JobOutcome::done(),
            60..80 => JobOutcome::staged(),
            80..95 => JobOutcome::recoverable("simulated transient error"),
            _ => JobOutcome::fatal("simulated permanent error"),
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from_file(&cli.config)?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.json);

    info!("Starting SRM scheduler v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", cli.config);

    let meter_provider = init_metrics();

    let policies = PolicyRegistry::with_builtins();
    config.validate(&policies)?;

    let storage: Arc<dyn JobStorage> = Arc::new(InMemoryJobStorage::new());
    let registry = SchedulerRegistry::builder().policies(policies);
    let registry = config
        .schedulers
        .iter()
        .try_fold(registry, |builder, settings| {
            builder.configure(settings.clone(), Some(Arc::clone(&storage)))
        })?
        .build();
    info!("Schedulers configured: {}", registry.ids().join(", "));

    registry.start_all()?;

    if cli.demo_jobs > 0 {
        let submitters = cli.demo_submitters.max(1);
        for scheduler in registry.iter() {
            for n in 0..cli.demo_jobs {
                let submitter = format!("user{}", n % submitters);
                let job = Job::builder(submitter, demo_action())
                    .lifetime(Duration::from_secs(600))
                    .build();
                if let Err(e) = scheduler.schedule(&job) {
                    warn!(scheduler_id = %scheduler.id(), "Failed to schedule demo job: {}", e);
                }
            }
            info!(
                scheduler_id = %scheduler.id(),
                "Submitted {} demo jobs from {} submitters", cli.demo_jobs, submitters
            );
        }
    }

    info!("Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    registry.stop_all().await;

    for scheduler in registry.iter() {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&scheduler.stats())?);
        } else {
            println!("{}", scheduler.info());
        }
    }

    if let Err(e) = meter_provider.shutdown() {
        warn!("Failed to shut down meter provider: {}", e);
    }
    Ok(())
}
