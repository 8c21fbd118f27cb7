use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use fanout_core::{
    setup_logger, BackoffPolicy, DispatchConfig, Dispatcher, EgressPool, IdentityPool, JobRequest,
    JobRunner, JsonLinesSink, LogSink, ProgressSink, SimulatedClient, SimulationProfile, TcpProber,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Paced batch submission engine with identity and egress rotation"
)]
struct Args {
    /// Target the requests are filed against
    #[arg(short, long)]
    target: String,

    /// Reason attached to every request
    #[arg(short, long, default_value = "spam")]
    reason: String,

    /// Number of requests to issue (1-500)
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Seconds between consecutive submissions (0.1-5.0)
    #[arg(short, long, default_value = "1.0")]
    delay: f64,

    /// Path to config.toml
    #[arg(short, long, default_value = "config/fanout.toml")]
    config: PathBuf,

    /// Seed for the simulated remote, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Probability that the simulated remote accepts a submission
    #[arg(long, default_value = "0.85")]
    success_ratio: f64,

    /// Probe every egress point before the run starts
    #[arg(long, default_value = "false")]
    probe_all: bool,

    /// Also write logs to daily files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit progress snapshots and the final report as JSON lines on stdout
    #[arg(long, default_value = "false")]
    json: bool,
}

fn load_config(path: &Path) -> Result<DispatchConfig> {
    let config = if path.exists() {
        DispatchConfig::from_path(path)?
    } else {
        DispatchConfig::default()
    };
    config.apply_env()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    let _guard = setup_logger(args.log_dir.as_deref())?;

    // 1. Config and job
    let config = load_config(&args.config).context("Failed to load config")?;
    let job = JobRequest::new(&args.target, &args.reason, args.count, args.delay);
    job.validate()?;

    // 2. Pools
    let identities = match &config.identity_file {
        Some(path) => IdentityPool::from_file(path)?,
        None => IdentityPool::load(config.identity_count),
    };
    let egress = EgressPool::load(&config.egress_file, config.egress_synth_size)?;
    let egress = Arc::new(egress);

    if args.probe_all {
        let prober = TcpProber::new(config.probe_timeout());
        let (healthy, _) = egress.probe_all(&prober, 10).await;
        if healthy == 0 {
            warn!("No egress point answered the probe; continuing with all of them");
        }
    }

    // 3. Remote
    let profile = SimulationProfile {
        success_ratio: args.success_ratio,
        ..SimulationProfile::default()
    };
    let backoff = BackoffPolicy::from_millis(config.backoff_min_ms, config.backoff_max_ms);
    let client = match args.seed {
        Some(seed) => SimulatedClient::with_seed(profile, backoff, seed),
        None => SimulatedClient::new(profile, backoff),
    };

    info!(
        "Target: {} | Reason: {} | Requests: {} | Delay: {:.1}s",
        job.target, job.reason, job.count, job.delay
    );

    // 4. Run
    let dispatcher = Dispatcher::new(Arc::new(identities), egress, Arc::new(client), config);
    let sink: &dyn ProgressSink = if args.json { &JsonLinesSink } else { &LogSink };
    JobRunner::run(&dispatcher, &job, sink).await?;
    Ok(())
}
