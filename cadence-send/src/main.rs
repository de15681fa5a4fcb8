//! cadence-send - Background daemon for scheduled publishing
//!
//! Runs the scheduler sweep, the token refresher and metrics collection on
//! their configured intervals until told to stop.

use anyhow::Context;
use clap::Parser;
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::oauth::ProviderRegistry;
use libcadence::platforms::mock::MockNetwork;
use libcadence::platforms::PublisherRegistry;
use libcadence::rate_limiter::RateLimiter;
use libcadence::service::Components;
use libcadence::storage::LocalObjectStore;
use libcadence::{CadenceError, CadenceService, Config, Database, Network};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

// Rate-limit windows older than this are deleted on each refresher tick
const RATE_WINDOW_RETENTION: i64 = 24 * 3600;

#[derive(Parser, Debug)]
#[command(name = "cadence-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
cadence-send - Background daemon for scheduled publishing

DESCRIPTION:
    cadence-send is a long-running daemon. On every poll it returns posts
    abandoned by a crashed worker to the queue, claims the posts that are
    due and publishes them, retrying transient failures with exponential
    backoff. Hourly it extends access tokens that are about to expire, and
    periodically it collects engagement metrics for recent posts.

    Several instances may run against one database: every post is claimed
    with a compare-and-swap, so each is published by exactly one of them.

USAGE:
    # Run in foreground (logs to stderr)
    cadence-send

    # Poll every 10 seconds with JSON logs
    cadence-send --poll-interval 10 --log-format json

    # Publish to in-memory networks (local testing)
    cadence-send --mock-networks

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (running jobs finish first)

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml

    [scheduler]
    poll_interval = 30      # seconds between sweeps
    max_concurrency = 8     # posts published in parallel
    publish_timeout = 30    # seconds per attempt
    max_retries = 5

    [scheduler.rate_limits]
    x = 50                  # posts per hour

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Log output format: text, json or pretty
    #[arg(long, env = "CADENCE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run every job once and exit
    #[arg(long)]
    once: bool,

    /// Publish to in-memory mock networks instead of the configured gateways.
    /// Token refresh and metrics collection are disabled in this mode.
    #[arg(long)]
    mock_networks: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = std::env::var(libcadence::logging::LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    LoggingConfig::new(cli.log_format, level, cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = format!("{:#}", e), "cadence-send stopped with an error");
        let code = e
            .downcast_ref::<CadenceError>()
            .map(CadenceError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(poll_interval) = cli.poll_interval {
        config.scheduler.poll_interval = poll_interval.max(1);
    }

    let service = if cli.mock_networks {
        let db = Database::new(&config.database.path)
            .await
            .context("failed to open the database")?;
        let components = mock_components(&config);
        CadenceService::with_components(db, config, components)
    } else {
        CadenceService::from_config(config).await?
    };

    let jobs = Jobs {
        service: &service,
        background: !cli.mock_networks,
    };

    info!(
        poll_interval = service.config().scheduler.poll_interval,
        mock_networks = cli.mock_networks,
        "cadence-send starting"
    );

    if cli.once {
        jobs.sweep().await;
        jobs.refresh().await;
        jobs.collect_metrics().await;
        info!("cadence-send: ran every job once, exiting");
        return Ok(());
    }

    run_daemon_loop(&jobs).await?;

    info!("cadence-send stopped");
    Ok(())
}

/// Mock networks for every network, no OAuth providers
fn mock_components(config: &Config) -> Components {
    let mut publishers = PublisherRegistry::new();
    for network in Network::all() {
        publishers.register_api(network, Arc::new(MockNetwork::success()));
    }

    Components {
        publishers,
        providers: ProviderRegistry::new(),
        store: Arc::new(LocalObjectStore::new(
            &config.media.storage_root,
            config.media.public_base_url.clone(),
        )),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

struct Jobs<'a> {
    service: &'a CadenceService,
    /// Token refresh and metrics collection
    background: bool,
}

impl Jobs<'_> {
    async fn sweep(&self) {
        if let Err(e) = self.service.scheduler().sweep(now()).await {
            error!(error = %e, "Scheduler sweep failed");
        }
    }

    async fn refresh(&self) {
        if !self.background {
            return;
        }
        let now = now();
        if let Err(e) = self.service.refresher().run_once(now).await {
            error!(error = %e, "Token refresh failed");
        }
        match RateLimiter::default()
            .cleanup_old_windows(self.service.database(), now - RATE_WINDOW_RETENTION)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed old rate-limit windows"),
            Err(e) => error!(error = %e, "Rate-limit cleanup failed"),
        }
    }

    async fn collect_metrics(&self) {
        if !self.background || !self.service.config().analytics.enabled {
            return;
        }
        if let Err(e) = self.service.analytics().run_once(now()).await {
            error!(error = %e, "Metrics collection failed");
        }
    }
}

/// Main daemon loop
///
/// The sweep, token refresh and metrics collection each run in their own
/// loop on their own timer, so a slow refresh pass never holds up
/// publishing. On shutdown every loop finishes the job it is running and
/// stops.
async fn run_daemon_loop(jobs: &Jobs<'_>) -> anyhow::Result<()> {
    let config = jobs.service.config();
    let (stop_tx, stop_rx) = watch::channel(false);

    let signal = async {
        let result = shutdown_signal().await;
        info!("Shutdown requested, stopping job loops");
        let _ = stop_tx.send(true);
        result
    };

    let (result, (), (), ()) = tokio::join!(
        signal,
        job_loop(period(config.scheduler.poll_interval), stop_rx.clone(), move || jobs.sweep()),
        job_loop(period(config.refresher.interval), stop_rx.clone(), move || jobs.refresh()),
        job_loop(period(config.analytics.interval), stop_rx, move || jobs.collect_metrics()),
    );

    result
}

/// Run `job` on every tick until `stop` flips
async fn job_loop<F, Fut>(every: Duration, mut stop: watch::Receiver<bool>, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => job().await,
        }
    }
}

fn period(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;

    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal, stopping gracefully...");
    }
    signals.handle().close();
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, stopping gracefully...");
    Ok(())
}
