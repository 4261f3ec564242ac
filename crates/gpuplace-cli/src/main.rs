//! gpuplace CLI
//!
//! Command-line interface for operating the gpuplace scheduler.

mod commands;

use clap::{Parser, Subcommand};
use gpuplace_core::RuntimeKind;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpuplace - GPU-aware placement of model servers across runners
#[derive(Parser, Debug)]
#[command(name = "gpuplace")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scheduler API address
    #[arg(long, default_value = "http://localhost:9090", env = "GPUPLACE_API", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a workload for placement
    Submit {
        /// Model to serve (e.g., meta-llama/Llama-3-8B)
        model: String,

        /// Memory the model needs (e.g., 16GiB)
        #[arg(long)]
        memory: String,

        /// Runtime (vllm, ollama)
        #[arg(long, default_value = "vllm")]
        runtime: RuntimeKind,

        /// Context length passed to the runtime
        #[arg(long, default_value_t = 0)]
        context_length: u32,

        /// Only use GPU counts that divide this number (e.g., attention heads)
        #[arg(long)]
        divisor_of: Option<u32>,

        /// Use at most this many GPUs
        #[arg(long)]
        max_gpus: Option<u32>,

        /// Extra runtime argument (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Cancel a workload
    Cancel {
        /// Workload ID
        id: Uuid,
    },

    /// Mark a workload completed and release its GPUs
    Complete {
        /// Workload ID
        id: Uuid,
    },

    /// Evict a slot
    Evict {
        /// Slot ID
        slot: Uuid,
    },

    /// Declare a runner disconnected
    Disconnect {
        /// Runner ID
        runner: String,
    },

    /// List workloads
    Ps,

    /// List runners and their free memory
    Runners,

    /// List ledger allocations
    Allocations,

    /// List slots
    Slots,

    /// Mark a slot as recently used so idle eviction skips it
    Touch {
        /// Slot ID
        slot: Uuid,
    },

    /// Show recent scheduling decisions
    Decisions {
        /// Number of decisions to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show scheduler status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            model,
            memory,
            runtime,
            context_length,
            divisor_of,
            max_gpus,
            args,
        } => {
            let options = commands::SubmitOptions {
                model,
                runtime: Some(runtime),
                memory,
                context_length,
                divisor_of,
                max_gpus,
                args,
            };
            commands::submit(&client, options).await?;
        }
        Commands::Cancel { id } => {
            commands::cancel(&client, id).await?;
        }
        Commands::Complete { id } => {
            commands::complete(&client, id).await?;
        }
        Commands::Evict { slot } => {
            commands::evict(&client, slot).await?;
        }
        Commands::Disconnect { runner } => {
            commands::disconnect(&client, runner).await?;
        }
        Commands::Ps => {
            commands::ps(&client).await?;
        }
        Commands::Runners => {
            commands::runners(&client).await?;
        }
        Commands::Allocations => {
            commands::allocations(&client).await?;
        }
        Commands::Slots => {
            commands::slots(&client).await?;
        }
        Commands::Touch { slot } => {
            commands::touch(&client, slot).await?;
        }
        Commands::Decisions { limit } => {
            commands::decisions(&client, limit).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
