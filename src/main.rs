use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice::config::{LoggingConfig, SluiceConfig};
use sluice::ratelimit::{
    Bucket, Decision, LeakyBucket, Limiter, NotifyingBucket, Resolver, RuleResolver, SystemClock,
    TracingSink,
};
use sluice::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Leaky-bucket admission control")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a limiter with a stream of hits against an in-memory store
    Simulate {
        /// Subject key; `parent:child` also charges the parent bucket
        #[arg(short, long)]
        key: String,

        /// Number of hits to attempt
        #[arg(long, default_value_t = 20)]
        hits: u64,

        /// Delay between hits in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Print the limits resolved for a key
    Resolve {
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SluiceConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging)?;
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules = config.limiter.load_rules()?;

    match cli.command {
        Command::Resolve { key } => {
            let resolver = RuleResolver::new(&rules, key, config.limiter.defaults());
            println!("{}", serde_json::to_string_pretty(&resolver.params())?);
        }
        Command::Simulate {
            key,
            hits,
            interval_ms,
        } => {
            let resolver = RuleResolver::new(&rules, key, config.limiter.defaults());
            simulate(&config, &resolver, hits, Duration::from_millis(interval_ms)).await?;
        }
    }

    Ok(())
}

/// Initialize tracing from the logging configuration. `RUST_LOG` wins.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn simulate(
    config: &SluiceConfig,
    resolver: &dyn Resolver,
    hits: u64,
    interval: Duration,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let bucket = LeakyBucket::with_clock(
        &resolver.key(),
        resolver.max(),
        resolver.rate(),
        Arc::new(SystemClock),
    )?;

    info!(
        key = %resolver.key(),
        max = resolver.max(),
        rate = resolver.rate(),
        timeout = resolver.duration(),
        "Starting simulation"
    );

    let timeout = resolver.duration();
    let summary = if config.limiter.notifications {
        let bucket = NotifyingBucket::new(bucket, Arc::new(TracingSink));
        run(Limiter::new(store.clone(), bucket)?, &store, timeout, hits, interval).await?
    } else {
        run(Limiter::new(store.clone(), bucket)?, &store, timeout, hits, interval).await?
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
struct Summary {
    admitted: u64,
    throttled: u64,
    vetoed: u64,
    hits: u64,
    remaining: u64,
    backoff: u64,
    store: BTreeMap<String, Value>,
}

async fn run<B: Bucket>(
    mut limiter: Limiter<B>,
    store: &MemoryStore,
    timeout_secs: u64,
    hits: u64,
    interval: Duration,
) -> anyhow::Result<Summary> {
    let mut ticker = tokio::time::interval(interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let (mut admitted, mut throttled, mut vetoed) = (0u64, 0u64, 0u64);
    for attempt in 1..=hits {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        match limiter.admit(timeout_secs)? {
            Decision::Admitted { limit, remaining } => {
                admitted += 1;
                info!(attempt, limit, remaining, "Admitted");
            }
            Decision::Throttled {
                limit,
                remaining,
                backoff,
            } => {
                throttled += 1;
                warn!(attempt, limit, remaining, backoff, "Throttled");
            }
            Decision::Vetoed {
                limit,
                remaining,
                veto,
            } => {
                vetoed += 1;
                info!(attempt, limit, remaining, reason = %veto.reason, "Vetoed");
            }
        }
    }

    info!(admitted, throttled, vetoed, "Simulation finished");

    store.purge_expired();
    Ok(Summary {
        admitted,
        throttled,
        vetoed,
        hits: limiter.hits(),
        remaining: limiter.remaining(),
        backoff: limiter.backoff()?,
        store: store.snapshot(),
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
