//! gpuplace daemon
//!
//! Runs either the scheduler control plane or a runner agent.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gpuplace_api::{create_router, create_runner_router};
use gpuplace_core::{parse_memory, DaemonConfig, RankingPolicy};
use gpuplace_network::{HttpSlotClient, ReporterConfig, StatusReporter};
use gpuplace_runtime::{
    InventoryConfig, InventoryTracker, ProcessRuntime, ProcessRuntimeConfig, SlotRuntime,
};
use gpuplace_scheduler::{AllocationLedger, RunnerRegistry, Scheduler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// gpuplace daemon - GPU-aware placement of model servers across runners
#[derive(Parser, Debug)]
#[command(name = "gpuplaced")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short, global = true, env = "GPUPLACE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Address to bind the API server
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler control plane
    Scheduler(SchedulerArgs),
    /// Run a runner agent on this machine
    Runner(RunnerArgs),
}

#[derive(Args, Debug)]
struct SchedulerArgs {
    /// Port for the scheduler API
    #[arg(long)]
    port: Option<u16>,

    /// Runner ranking policy (least-loaded, first-fit)
    #[arg(long)]
    ranking: Option<RankingPolicy>,

    /// Placement attempts per workload
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Evict idle slots when a workload fits nowhere else
    #[arg(long)]
    evict_stale_slots: bool,
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Runner identifier (defaults to the hostname)
    #[arg(long, env = "GPUPLACE_RUNNER_ID")]
    runner_id: Option<String>,

    /// Port for the runner slot API
    #[arg(long)]
    port: Option<u16>,

    /// Scheduler base URL
    #[arg(long, env = "GPUPLACE_SCHEDULER_URL")]
    scheduler_url: Option<String>,

    /// URL the scheduler uses to reach this runner
    #[arg(long)]
    advertise_url: Option<String>,

    /// Simulate a single GPU instead of querying hardware
    #[arg(long, env = "GPUPLACE_CPU_ONLY")]
    cpu_only: bool,

    /// Memory cap, e.g. 24GiB
    #[arg(long)]
    memory: Option<String>,
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn default_runner_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "runner".to_string())
}

async fn serve(addr: SocketAddr, router: axum::Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router).await.context("Server error")
}

async fn run_scheduler(config: DaemonConfig, args: SchedulerArgs) -> Result<()> {
    let mut scheduler_config = config.scheduler;
    if let Some(ranking) = args.ranking {
        scheduler_config.ranking = ranking;
    }
    if let Some(max_attempts) = args.max_attempts {
        scheduler_config.max_attempts = max_attempts;
    }
    if args.evict_stale_slots {
        scheduler_config.evict_stale_slots = true;
    }
    let port = args.port.unwrap_or(config.api.scheduler_port);

    info!(
        ranking = %scheduler_config.ranking,
        max_attempts = scheduler_config.max_attempts,
        runner_timeout_secs = scheduler_config.runner_timeout_secs,
        evict_stale_slots = scheduler_config.evict_stale_slots,
        "Starting gpuplace scheduler v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = HttpSlotClient::new(Duration::from_secs(
        scheduler_config.slot_start_timeout_secs.max(1),
    ))?;
    let scheduler = Arc::new(Scheduler::new(
        scheduler_config,
        Arc::new(AllocationLedger::new()),
        Arc::new(RunnerRegistry::new()),
        Arc::new(client),
    ));
    scheduler.clone().spawn_liveness_loop();
    scheduler.clone().spawn_queue_loop();

    let mut router = create_router(scheduler);
    if config.api.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, port)
        .parse()
        .context("Invalid address")?;
    serve(addr, router).await
}

async fn run_runner(config: DaemonConfig, args: RunnerArgs) -> Result<()> {
    let mut runner_config = config.runner;
    if let Some(id) = args.runner_id {
        runner_config.runner_id = Some(id);
    }
    if let Some(url) = args.scheduler_url {
        runner_config.scheduler_url = url;
    }
    if let Some(url) = args.advertise_url {
        runner_config.advertise_url = Some(url);
    }
    if args.cpu_only {
        runner_config.cpu_only = true;
    }
    if let Some(memory) = args.memory {
        runner_config.memory = Some(parse_memory(&memory)?);
    }
    let port = args.port.unwrap_or(config.api.runner_port);
    if runner_config.advertise_url.is_none() {
        runner_config.advertise_url = Some(format!("http://{}:{}", default_runner_id(), port));
    }

    let runner_id = runner_config
        .runner_id
        .clone()
        .unwrap_or_else(default_runner_id);

    info!(
        runner_id = %runner_id,
        scheduler = %runner_config.scheduler_url,
        cpu_only = runner_config.cpu_only,
        "Starting gpuplace runner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let inventory = Arc::new(InventoryTracker::detect(&InventoryConfig::from_runner(
        runner_id,
        &runner_config,
    )));
    inventory
        .clone()
        .spawn_refresh_loop(Duration::from_secs(runner_config.refresh_interval_secs.max(1)));

    let reporter = Arc::new(StatusReporter::new(
        ReporterConfig::from_runner(&runner_config),
        inventory.clone(),
    )?);
    reporter.spawn();

    let runtime: Arc<dyn SlotRuntime> = Arc::new(ProcessRuntime::new(
        ProcessRuntimeConfig::from_runner(&runner_config),
        inventory.clone(),
    ));
    info!(runtime = runtime.name(), "Slot runtime ready");

    let router = create_runner_router(runtime, inventory);
    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, port)
        .parse()
        .context("Invalid address")?;
    serve(addr, router).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(address) = cli.address {
        config.api.rest_address = address;
    }

    init_logging(&config.logging.level)?;

    match cli.command {
        Command::Scheduler(args) => run_scheduler(config, args).await,
        Command::Runner(args) => run_runner(config, args).await,
    }
}
