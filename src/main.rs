use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use cron_runner::config::RunnerConfig;
use cron_runner::context::RunnerContext;
use cron_runner::epoch::EpochScheduler;
use cron_runner::heartbeat::HeartbeatSupervisor;
use cron_runner::metrics::{serve_metrics, Metrics};
use cron_runner::pipeline::{self, EventExecutionPool, EventRetrievalPool, SiteDiscoveryLoop};
use cron_runner::remote::{run_remote_listener, RemoteState};
use cron_runner::shutdown::install_shutdown_handler;
use cron_runner::source::{CliJobSource, JobSource};

#[derive(Parser, Debug)]
#[command(name = "cron-runner")]
#[command(version)]
#[command(about = "Runtime supervisor for a distributed cron system")]
struct Args {
    /// Path to the executor binary
    #[arg(long = "cli", default_value = "/usr/local/bin/wp")]
    cli_path: PathBuf,

    /// Path to the target installation
    #[arg(long = "wp", default_value = "/var/www/html")]
    install_path: PathBuf,

    /// Network ID, `0` to disable
    #[arg(long, default_value = "0")]
    network: u64,

    /// Number of workers to retrieve events
    #[arg(long = "workers-get", default_value = "1")]
    workers_get: usize,

    /// Number of workers to run events
    #[arg(long = "workers-run", default_value = "5")]
    workers_run: usize,

    /// Seconds between event retrieval
    #[arg(long = "get-events-interval", default_value = "60")]
    get_events_interval: u64,

    /// Heartbeat interval in seconds, `0` disables heartbeat reporting
    #[arg(long = "heartbeat", default_value = "60")]
    heartbeat_interval: u64,

    /// Log file path, omit to log to stdout
    #[arg(long = "log")]
    log_dest: Option<PathBuf>,

    /// Log format
    #[arg(long = "log-format", default_value = "json")]
    log_format: LogFormat,

    /// Include additional log data for debugging
    #[arg(long)]
    debug: bool,

    /// Use the orchestrate site-listing command instead of the plain one
    #[arg(long = "smart-site-list")]
    smart_site_list: bool,

    /// Listen address for prometheus metrics (e.g. :4444)
    #[arg(long = "metrics-listen-addr")]
    metrics_listen_addr: Option<SocketAddr>,

    /// Token to authenticate remote job-run requests; empty disables the
    /// remote listener
    #[arg(long)]
    token: Option<String>,

    /// Listen address for the remote trigger listener
    #[arg(long = "remote-listen-addr", default_value = "0.0.0.0:7227")]
    remote_listen_addr: SocketAddr,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn setup_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug { "debug" } else { "info" })
    });

    match (&args.log_dest, &args.log_format) {
        (None, LogFormat::Text) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        (None, LogFormat::Json) => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let writer = std::sync::Mutex::new(file);
            match format {
                LogFormat::Text => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .with_ansi(false)
                        .init();
                }
                LogFormat::Json => {
                    tracing_subscriber::fmt()
                        .json()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .init();
                }
            }
        }
    }

    Ok(())
}

/// Fatal configuration error: print the message and usage, exit before any
/// worker starts.
fn usage_exit(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!();
    let _ = Args::command().write_help(&mut std::io::stderr());
    std::process::exit(3);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(&args) {
        usage_exit(&format!("failed to set up logging: {}", e));
    }

    let mut config = RunnerConfig {
        cli_path: args.cli_path,
        install_path: args.install_path,
        network_id: args.network,
        get_workers: args.workers_get,
        run_workers: args.workers_run,
        get_events_interval: args.get_events_interval,
        heartbeat_interval: args.heartbeat_interval,
        smart_site_list: args.smart_site_list,
        debug: args.debug,
        metrics_listen_addr: args.metrics_listen_addr,
        remote_token: args.token,
        remote_listen_addr: args.remote_listen_addr,
    };

    if let Err(e) = config.validate() {
        usage_exit(&e.to_string());
    }

    tracing::info!(
        get_workers = config.get_workers,
        run_workers = config.run_workers,
        get_events_interval = config.get_events_interval,
        "Starting cron runner"
    );

    let shutdown = install_shutdown_handler();
    let metrics = Arc::new(Metrics::new());
    let ctx = RunnerContext::new(
        shutdown,
        config.get_workers,
        config.run_workers,
        Arc::clone(&metrics),
    );
    let scheduler = Arc::new(EpochScheduler::new(ctx.shutdown.clone()));
    let source: Arc<dyn JobSource> =
        Arc::new(CliJobSource::new(config.clone(), Arc::clone(&metrics)));

    let (sites_tx, sites_rx) = pipeline::channel();
    let (jobs_tx, jobs_rx) = pipeline::channel();

    if let Some(addr) = config.metrics_listen_addr {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            serve_metrics(addr, metrics).await;
        });
    }

    if config.remote_enabled() {
        let state = RemoteState {
            ctx: Arc::clone(&ctx),
            source: Arc::clone(&source),
            token: config.remote_token.clone().unwrap_or_default(),
        };
        let addr = config.remote_listen_addr;
        tokio::spawn(async move {
            run_remote_listener(addr, state).await;
        });
    }

    let discovery = SiteDiscoveryLoop::new(
        Arc::clone(&ctx),
        Arc::clone(&source),
        Arc::clone(&scheduler),
        config.get_events_interval,
        sites_tx.clone(),
    );
    tokio::spawn(async move {
        discovery.run().await;
    });

    EventRetrievalPool::new(Arc::clone(&ctx), Arc::clone(&source))
        .spawn(sites_rx, jobs_tx.clone());

    EventExecutionPool::new(
        Arc::clone(&ctx),
        Arc::clone(&source),
        Arc::clone(&scheduler),
        config.heartbeat_interval > 0,
    )
    .spawn(jobs_rx);

    // The supervisor blocks until shutdown and owns the drain.
    HeartbeatSupervisor::new(
        ctx,
        source,
        scheduler,
        config.heartbeat_interval,
        config.smart_site_list,
        sites_tx,
        jobs_tx,
    )
    .run()
    .await;

    std::process::exit(0);
}
