use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::Settings;
use slidegate::{MemoryStore, RedisStore, SlidingWindowLimiter, Store};

/// Threshold used when neither the settings nor the command line set one.
const DEMO_THRESHOLD: i64 = 2;

/// How often the in-process store drops expired records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Run a few admission checks against a store and print the decisions.
#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about)]
struct Args {
    /// Key to check
    #[arg(default_value = "foo")]
    key: String,

    /// YAML settings file, layered under SLIDEGATE_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redis URL, or comma separated seed nodes with --cluster
    #[arg(long, env = "REDIS_ENDPOINT")]
    redis_url: Option<String>,

    /// Connect to a Redis Cluster
    #[arg(long)]
    cluster: bool,

    /// Use the in-process store even if a Redis URL is configured
    #[arg(long)]
    memory: bool,

    /// Maximum admits per window
    #[arg(long)]
    threshold: Option<i64>,

    /// Window size in seconds
    #[arg(long)]
    window_secs: Option<u64>,

    /// Bucket precision in seconds
    #[arg(long)]
    precision_secs: Option<u64>,

    /// Stale bucket age in seconds
    #[arg(long)]
    stale_secs: Option<u64>,

    /// Number of checks to run
    #[arg(long, default_value_t = 3)]
    calls: u32,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting slidegate {}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(args.config.as_deref())?;
    apply_overrides(&mut settings, &args);
    let config = settings.limiter_config()?;

    info!(
        threshold = config.threshold(),
        window = ?config.window_size(),
        precision = ?config.bucket_precision(),
        "Configuration loaded"
    );

    match settings.store.redis_url.as_deref() {
        Some(url) if !args.memory => {
            if settings.store.cluster {
                let nodes: Vec<String> = url.split(',').map(|s| s.trim().to_string()).collect();
                let store = RedisStore::connect_cluster(nodes).await?;
                run(SlidingWindowLimiter::new(store, config), &args.key, args.calls).await;
            } else {
                let store = RedisStore::connect(url).await?;
                run(SlidingWindowLimiter::new(store, config), &args.key, args.calls).await;
            }
        }
        _ => {
            info!("Using in-process store");
            let store = Arc::new(MemoryStore::new());
            let purger = store.spawn_purger(PURGE_INTERVAL);
            run(SlidingWindowLimiter::new(store, config), &args.key, args.calls).await;
            purger.abort();
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(url) = &args.redis_url {
        settings.store.redis_url = Some(url.clone());
    }
    if args.cluster {
        settings.store.cluster = true;
    }

    let limiter = &mut settings.limiter;
    if let Some(threshold) = args.threshold {
        limiter.threshold = Some(threshold);
    }
    limiter.threshold.get_or_insert(DEMO_THRESHOLD);
    if let Some(secs) = args.window_secs {
        limiter.window_size_secs = secs;
    }
    if let Some(secs) = args.precision_secs {
        limiter.bucket_precision_secs = secs;
    }
    if let Some(secs) = args.stale_secs {
        limiter.stale_bucket_age_secs = secs;
    }
}

async fn run<S: Store>(limiter: SlidingWindowLimiter<S>, key: &str, calls: u32) {
    for call in 1..=calls {
        match limiter.allow(key).await {
            Ok(true) => println!("{} #{}: admitted", key, call),
            Ok(false) => println!("{} #{}: denied", key, call),
            Err(e) => println!("{} #{}: error: {}", key, call, e),
        }
    }
}
